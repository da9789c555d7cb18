//! # Parley Memory
//!
//! Storage backends for agent memory and conversation transcripts.
//!
//! - [`InMemoryStore`]: sharded, per-key locked memory for a single process
//! - [`FileMemoryStore`]: the same, persisted to a JSON snapshot after each write
//! - [`InMemoryTranscriptStore`]: transcripts and records kept in memory
//! - [`FileTranscriptStore`]: one JSON-lines file per conversation plus its record

mod file_memory;
mod file_transcript;
mod in_memory;
mod in_memory_transcript;

pub use file_memory::FileMemoryStore;
pub use file_transcript::FileTranscriptStore;
pub use in_memory::InMemoryStore;
pub use in_memory_transcript::InMemoryTranscriptStore;
