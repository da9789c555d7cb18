//! Error types for bus operations

use std::time::Duration;

use parley_core::{AgentId, ConversationId};
use thiserror::Error;

/// Result type for bus operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur during bus operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// No log exists for the conversation
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A log is already open for the conversation
    #[error("Conversation already open: {0}")]
    ConversationExists(ConversationId),

    /// The conversation was archived; its log accepts no more messages
    #[error("Conversation sealed: {0}")]
    ConversationSealed(ConversationId),

    /// The agent has no inbox on the bus
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// The agent's inbox stayed full for the whole dispatch timeout
    #[error("Delivery to {agent} timed out after {waited:?}")]
    DeliveryTimeout { agent: AgentId, waited: Duration },

    /// The agent dropped its inbox
    #[error("Inbox of {0} is closed")]
    InboxClosed(AgentId),

    /// A published message would break the conversation's total order
    #[error("Out-of-order publish on {conversation}: expected sequence {expected}, got {found}")]
    SequenceGap {
        conversation: ConversationId,
        expected: u64,
        found: u64,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bus cannot take more load
    #[error("Bus exhausted: {0}")]
    ResourceExhausted(String),
}

impl MeshError {
    /// Errors that must abort the conversation instead of being recovered from
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::ResourceExhausted(_) | MeshError::SequenceGap { .. }
        )
    }
}
