use parley_agent::{ConfigError, ParleyError};
use parley_core::{IdValidationError, MemoryError, TranscriptError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Parley(#[from] ParleyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdValidationError),

    #[error("invalid scenario: {0}")]
    Scenario(String),

    #[error("cannot read '{path}': {message}")]
    Io { path: String, message: String },

    #[error("cannot encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
}

impl CliError {
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Parley(e) => e.error_code(),
            CliError::Config(_) => "CONFIG",
            CliError::Memory(_) => "MEMORY",
            CliError::Transcript(_) => "TRANSCRIPT",
            CliError::InvalidId(_) => "INVALID_ID",
            CliError::Scenario(_) => "SCENARIO",
            CliError::Io { .. } => "IO",
            CliError::Encode(_) => "ENCODE",
            CliError::Output(_) => "OUTPUT",
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
