//! Memory store errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::AgentId;

/// Memory operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Read,
    Write,
    Query,
    Modify,
    Remove,
    DropScope,
    Persist,
    Restore,
}

impl fmt::Display for MemoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryOperation::Read => "read",
            MemoryOperation::Write => "write",
            MemoryOperation::Query => "query",
            MemoryOperation::Modify => "modify",
            MemoryOperation::Remove => "remove",
            MemoryOperation::DropScope => "drop_scope",
            MemoryOperation::Persist => "persist",
            MemoryOperation::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    /// A private scope may only be written by the agent that owns it.
    #[error("agent '{writer}' cannot write the private scope of '{owner}'")]
    PrivateScopeViolation { owner: AgentId, writer: AgentId },

    /// The backing storage failed (I/O, disk full, corrupted snapshot).
    #[error("memory {operation} failed: {message}")]
    Storage {
        operation: MemoryOperation,
        message: String,
    },

    /// A value could not be (de)serialized.
    #[error("memory serialization failed: {0}")]
    Serialization(String),

    /// The store refuses further writes.
    #[error("memory store exhausted: {0}")]
    ResourceExhausted(String),
}

impl MemoryError {
    pub fn storage(operation: MemoryOperation, message: impl Into<String>) -> Self {
        MemoryError::Storage {
            operation,
            message: message.into(),
        }
    }

    /// Storage-level failures abort the conversation that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoryError::Storage { .. } | MemoryError::ResourceExhausted(_)
        )
    }
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;
