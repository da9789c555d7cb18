//! Error types for the agent runtime, orchestrator and session.

use parley_core::{AgentId, ConversationId, CoreError, MemoryError, TranscriptError};
use parley_mesh::MeshError;
use parley_tools::GatewayError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by a [`Session`](crate::Session) and its conversations.
///
/// Agent-scoped problems (failed reasoning, tool failures, missed turns) are
/// not errors at this level: they are recorded on the conversation and
/// recovered from. What reaches callers is either a usage error or
/// [`ParleyError::Fatal`].
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The agent is not registered
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// No conversation with this id is known to the session or its store
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The conversation is already archived
    #[error("Conversation already archived: {0}")]
    ConversationArchived(ConversationId),

    /// A dynamic policy names a coordinator that cannot coordinate
    #[error("Agent '{0}' is not a registered coordinator")]
    NotCoordinator(AgentId),

    /// Bus or storage exhaustion; the conversation's task was aborted
    #[error("Fatal: {0}")]
    Fatal(String),

    /// The session was shut down
    #[error("Session is shut down")]
    Shutdown,
}

impl ParleyError {
    /// Whether the error aborts a conversation rather than being recovered from
    pub fn is_fatal(&self) -> bool {
        match self {
            ParleyError::Fatal(_) => true,
            ParleyError::Mesh(e) => e.is_fatal(),
            ParleyError::Memory(e) => e.is_fatal(),
            ParleyError::Transcript(e) => e.is_fatal(),
            ParleyError::Core(CoreError::Memory(e)) => e.is_fatal(),
            ParleyError::Core(CoreError::Transcript(e)) => e.is_fatal(),
            _ => false,
        }
    }

    /// Stable code for logs and the CLI
    pub fn error_code(&self) -> &'static str {
        match self {
            ParleyError::Core(_) => "CORE",
            ParleyError::Memory(_) => "MEMORY",
            ParleyError::Transcript(_) => "TRANSCRIPT",
            ParleyError::Mesh(_) => "BUS",
            ParleyError::Gateway(_) => "GATEWAY",
            ParleyError::Config(_) => "CONFIG",
            ParleyError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            ParleyError::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            ParleyError::ConversationArchived(_) => "CONVERSATION_ARCHIVED",
            ParleyError::NotCoordinator(_) => "NOT_COORDINATOR",
            ParleyError::Fatal(_) => "FATAL",
            ParleyError::Shutdown => "SHUTDOWN",
        }
    }

    /// Promote an error to [`ParleyError::Fatal`] if it is fatal
    pub(crate) fn escalate(self) -> Self {
        if self.is_fatal() && !matches!(self, ParleyError::Fatal(_)) {
            ParleyError::Fatal(self.to_string())
        } else {
            self
        }
    }
}

/// Result type for session and orchestrator operations
pub type ParleyResult<T> = Result<T, ParleyError>;
