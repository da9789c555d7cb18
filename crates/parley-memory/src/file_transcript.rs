use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use parley_core::transcript::{Transcript, TranscriptError, TranscriptStore};
use parley_core::{ConversationId, ConversationRecord, Message};

/// Transcript store writing one directory entry pair per conversation:
///
/// - `<dir>/<conversation>.jsonl`: one JSON message per line, in sequence order
/// - `<dir>/<conversation>.json`: the conversation record
///
/// Together these are enough to replay a conversation.
pub struct FileTranscriptStore {
    dir: PathBuf,
    last_sequence: DashMap<ConversationId, u64>,
}

impl FileTranscriptStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TranscriptError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error("create", &dir, e))?;
        Ok(Self {
            dir,
            last_sequence: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, conversation: &ConversationId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", conversation))
    }

    fn record_path(&self, conversation: &ConversationId) -> PathBuf {
        self.dir.join(format!("{}.json", conversation))
    }

    fn read_log(&self, conversation: &ConversationId) -> Result<Option<Vec<Message>>, TranscriptError> {
        let path = self.log_path(conversation);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("open", &path, e)),
        };
        let mut messages = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_error("read", &path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = serde_json::from_str(&line).map_err(|e| {
                TranscriptError::Corrupted(format!("{} line {}: {}", path.display(), n + 1, e))
            })?;
            messages.push(message);
        }
        Ok(Some(messages))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> TranscriptError {
    tracing::error!(path = ?path, error = %e, "Transcript storage failed to {}", action);
    TranscriptError::Storage(format!("failed to {} {}: {}", action, path.display(), e))
}

impl TranscriptStore for FileTranscriptStore {
    fn append(&self, message: &Message) -> Result<(), TranscriptError> {
        let conversation = &message.conversation_id;
        let mut last = match self.last_sequence.entry(conversation.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.into_ref(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let existing = self
                    .read_log(conversation)?
                    .map(|log| log.len() as u64)
                    .unwrap_or(0);
                entry.insert(existing)
            }
        };
        let expected = *last + 1;
        if message.sequence != expected {
            return Err(TranscriptError::SequenceGap {
                conversation: conversation.clone(),
                expected,
                found: message.sequence,
            });
        }

        let mut line = serde_json::to_string(message)
            .map_err(|e| TranscriptError::Corrupted(e.to_string()))?;
        line.push('\n');
        let path = self.log_path(conversation);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error("open", &path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_error("append to", &path, e))?;

        *last = message.sequence;
        tracing::trace!(conversation = %conversation, sequence = message.sequence, "Appended transcript line");
        Ok(())
    }

    fn load(&self, conversation: &ConversationId) -> Result<Transcript, TranscriptError> {
        let mut transcript = Transcript::new(conversation.clone());
        match self.read_log(conversation)? {
            Some(messages) => {
                for message in messages {
                    transcript.push(message)?;
                }
            }
            None if self.record_path(conversation).exists() => {}
            None => return Err(TranscriptError::NotFound(conversation.clone())),
        }
        Ok(transcript)
    }

    fn save_record(&self, record: &ConversationRecord) -> Result<(), TranscriptError> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| TranscriptError::Corrupted(e.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| io_error("write", &tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| io_error("rename", &tmp_path, e))?;
        tracing::debug!(conversation = %record.id, state = %record.state, "Saved conversation record");
        Ok(())
    }

    fn load_record(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationRecord>, TranscriptError> {
        let path = self.record_path(conversation);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| TranscriptError::Corrupted(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    fn list(&self) -> Result<Vec<ConversationId>, TranscriptError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error("list", &self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error("list", &self.dir, e))?.path();
            let is_store_file = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("json") | Some("jsonl")
            );
            if !is_store_file {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = ConversationId::parse(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
