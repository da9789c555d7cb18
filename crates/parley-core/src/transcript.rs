//! Append-only conversation transcripts and their persistence trait.

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationRecord;
use crate::identifiers::ConversationId;
use crate::message::{Message, MessageDraft};

/// Errors raised while building, storing or loading transcripts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    /// A message would break the gap-free sequence
    #[error("sequence gap in {conversation}: expected {expected}, got {found}")]
    SequenceGap {
        conversation: ConversationId,
        expected: u64,
        found: u64,
    },

    /// A message belongs to another conversation
    #[error("message for {found} appended to transcript of {expected}")]
    WrongConversation {
        expected: ConversationId,
        found: ConversationId,
    },

    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    /// The storage backend failed
    #[error("transcript storage failed: {0}")]
    Storage(String),

    #[error("transcript data corrupted: {0}")]
    Corrupted(String),
}

impl TranscriptError {
    /// Storage failures abort the conversation that hit them
    pub fn is_fatal(&self) -> bool {
        matches!(self, TranscriptError::Storage(_))
    }
}

/// The ordered, append-only message log of one conversation.
///
/// Sequence numbers start at 1 and increase by exactly one per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    conversation_id: ConversationId,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Sequence number the next message will get
    pub fn next_sequence(&self) -> u64 {
        self.messages.len() as u64 + 1
    }

    /// Sequence number of the last message, 0 when empty
    pub fn last_sequence(&self) -> u64 {
        self.messages.len() as u64
    }

    /// Stamp `draft` with the next sequence number and append it
    pub fn append(&mut self, draft: MessageDraft) -> &Message {
        let message = draft.sequence(self.conversation_id.clone(), self.next_sequence());
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Append an already sequenced message, as when replaying a stored log
    pub fn push(&mut self, message: Message) -> Result<(), TranscriptError> {
        if message.conversation_id != self.conversation_id {
            return Err(TranscriptError::WrongConversation {
                expected: self.conversation_id.clone(),
                found: message.conversation_id,
            });
        }
        let expected = self.next_sequence();
        if message.sequence != expected {
            return Err(TranscriptError::SequenceGap {
                conversation: self.conversation_id.clone(),
                expected,
                found: message.sequence,
            });
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages with sequence `>= from`
    pub fn since(&self, from: u64) -> &[Message] {
        let start = from.saturating_sub(1).min(self.messages.len() as u64) as usize;
        &self.messages[start..]
    }

    /// The last `n` messages
    pub fn tail(&self, n: usize) -> &[Message] {
        &self.messages[self.messages.len().saturating_sub(n)..]
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Durable storage for transcripts and conversation records.
///
/// `append` is called once per transcript message, in sequence order.
pub trait TranscriptStore: Send + Sync {
    fn append(&self, message: &Message) -> Result<(), TranscriptError>;

    /// Rebuild a transcript, checking that it is gap-free
    fn load(&self, conversation: &ConversationId) -> Result<Transcript, TranscriptError>;

    fn save_record(&self, record: &ConversationRecord) -> Result<(), TranscriptError>;

    fn load_record(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationRecord>, TranscriptError>;

    /// Ids of every stored conversation
    fn list(&self) -> Result<Vec<ConversationId>, TranscriptError>;
}
