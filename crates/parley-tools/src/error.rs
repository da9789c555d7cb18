//! Gateway error types

use parley_core::{IdValidationError, ToolCallError, ToolName};
use thiserror::Error;

/// Errors raised by the registry and gateway themselves.
///
/// Tool failures are not gateway errors: they are outcomes, carried as
/// [`ToolError`](parley_core::ToolError) inside the resolved call.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The tool reported a name that is not a valid identifier
    #[error("invalid tool name '{name}': {source}")]
    InvalidToolName {
        name: String,
        #[source]
        source: IdValidationError,
    },

    /// A tool with this name is already registered
    #[error("tool '{0}' is already registered")]
    DuplicateTool(ToolName),

    /// The call handed to the gateway was already resolved
    #[error(transparent)]
    Call(#[from] ToolCallError),
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
