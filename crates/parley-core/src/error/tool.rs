//! Tool failures and tool call lifecycle errors.

use serde::{Deserialize, Serialize};

use crate::identifiers::{IdempotencyKey, ToolCallId, ToolName};

/// Why a tool call failed.
///
/// Failures are data: they are cached by the gateway, stored in resolved
/// [`ToolCall`](crate::tool::ToolCall)s and handed back to reasoners, so the
/// type is serializable and cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ToolError {
    /// A failure that may succeed if retried (network blip, rate limit).
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// The arguments were rejected by the tool.
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },

    /// No tool is registered under this name.
    #[error("tool '{tool}' not found")]
    NotFound { tool: ToolName },

    /// A failure retrying will not fix.
    #[error("permanent failure: {message}")]
    Permanent { message: String },

    /// The call did not resolve within its time bound.
    #[error("timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// The idempotency key was already used with different arguments.
    #[error("idempotency key '{key}' reused with different arguments")]
    IdempotencyConflict { key: IdempotencyKey },

    /// The execution was aborted before it finished.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        ToolError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ToolError::Permanent {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        ToolError::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            message: message.into(),
        }
    }

    /// Whether the gateway should retry the attempt that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Transient { .. } | ToolError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }

    /// Stable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Transient { .. } => "transient",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::NotFound { .. } => "not_found",
            ToolError::Permanent { .. } => "permanent",
            ToolError::Timeout { .. } => "timeout",
            ToolError::IdempotencyConflict { .. } => "idempotency_conflict",
            ToolError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Errors from the tool call result slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    /// The call already carries an outcome.
    #[error("tool call '{0}' is already resolved")]
    AlreadyResolved(ToolCallId),
}

/// Result type for tool execution
pub type ToolResult<T> = Result<T, ToolError>;
