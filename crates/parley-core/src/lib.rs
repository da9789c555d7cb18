//! # Parley Core
//!
//! Core types and capability traits for the Parley multi-agent
//! orchestration runtime: identifiers, messages, memory, tool calls,
//! conversations and transcripts. Runtime behavior lives in the other
//! `parley-*` crates; this crate only defines what they exchange.

pub mod agent;
pub mod conversation;
pub mod error;
pub mod identifiers;
pub mod memory;
pub mod message;
pub mod reasoning;
pub mod tool;
pub mod transcript;

pub use agent::{AgentDescriptor, AgentLifetime, AgentState, COORDINATOR_TAG};
pub use conversation::{
    AuditEntry, AuditReason, ConversationRecord, ConversationSpec, ConversationState,
    TerminationConfig, TerminationReason, TurnPolicy,
};
pub use error::{
    CoreError, CoreResult, MemoryError, MemoryOperation, MemoryResult, OrchestrationFault,
    ToolCallError, ToolError, ToolResult,
};
pub use identifiers::{
    AgentId, ConversationId, CorrelationId, IdValidationError, IdempotencyKey, ToolCallId,
    ToolName,
};
pub use memory::{
    AgentMemory, InvalidMemoryKey, MemoryKey, MemoryKeys, MemoryRecord, MemoryScope,
    MemorySnapshot, MemoryStore, RecordIter, RecordPredicate, WriteOutcome,
};
pub use message::{
    ControlSignal, DedupKey, Message, MessageDraft, MessageKind, Payload, Recipients, Sender,
};
pub use reasoning::{Decision, Reasoner, ReasoningContext, ReasoningError, SpeakerSelector};
pub use tool::{Tool, ToolCall, ToolCallStatus, ToolOutcome};
pub use transcript::{Transcript, TranscriptError, TranscriptStore};
