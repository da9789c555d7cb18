//! Error Types
//!
//! Errors are organized by the component that raises them:
//! - `memory`: memory store failures
//! - `tool`: tool failures and tool call lifecycle errors
//! - `fault`: recoverable orchestration faults
//!
//! [`CoreError`] gathers the errors raised by the core types themselves.

mod fault;
mod memory;
mod tool;

pub use fault::OrchestrationFault;
pub use memory::{MemoryError, MemoryOperation, MemoryResult};
pub use tool::{ToolCallError, ToolError, ToolResult};

use crate::conversation::ConversationState;
use crate::identifiers::IdValidationError;
use crate::memory::InvalidMemoryKey;
use crate::reasoning::ReasoningError;
use crate::transcript::TranscriptError;

/// Errors raised by the core data model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdValidationError),

    #[error("invalid memory key: {0}")]
    InvalidMemoryKey(#[from] InvalidMemoryKey),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    ToolCall(#[from] ToolCallError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Reasoning(#[from] ReasoningError),

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("illegal conversation transition from {from} to {to}")]
    IllegalTransition {
        from: ConversationState,
        to: ConversationState,
    },
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
