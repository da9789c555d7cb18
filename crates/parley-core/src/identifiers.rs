//! Validated identifiers for agents, conversations, tools and messages.
//!
//! Every identifier that crosses a component boundary is a newtype so that an
//! agent id can never be passed where a conversation id is expected. Human
//! chosen ids (`AgentId`, `ToolName`, `IdempotencyKey`) go through `parse()`;
//! runtime generated ids (`ConversationId`, `CorrelationId`, `ToolCallId`) are
//! minted from UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length accepted for any parsed identifier.
pub const MAX_ID_LENGTH: usize = 128;

/// Error type for identifier validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdValidationError {
    /// The ID string is empty
    #[error("ID cannot be empty")]
    Empty,
    /// The ID has leading or trailing whitespace
    #[error("ID cannot have leading or trailing whitespace")]
    LeadingTrailingWhitespace,
    /// The ID is longer than [`MAX_ID_LENGTH`]
    #[error("ID too long: {0} characters (max 128)")]
    TooLong(usize),
    /// The ID contains invalid characters
    #[error("ID can only contain alphanumeric characters, hyphens, underscores, and dots")]
    InvalidCharacters,
    /// The ID is reserved for the runtime
    #[error("ID '{0}' is reserved")]
    Reserved(String),
}

fn validate(s: &str) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if s != s.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }
    if s.chars().count() > MAX_ID_LENGTH {
        return Err(IdValidationError::TooLong(s.chars().count()));
    }
    if !s
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(IdValidationError::InvalidCharacters);
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Get the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier for an agent.
    ///
    /// Valid IDs are non-empty, carry no surrounding whitespace and contain only
    /// alphanumerics, hyphens, underscores and dots. `orchestrator` is reserved
    /// for messages the runtime itself emits.
    ///
    /// ```
    /// use parley_core::AgentId;
    ///
    /// assert!(AgentId::parse("planner-1").is_ok());
    /// assert!(AgentId::parse(" planner").is_err());
    /// assert!(AgentId::parse("orchestrator").is_err());
    /// ```
    AgentId
);

impl AgentId {
    /// Name reserved for the orchestrator's own messages.
    pub const RESERVED: &'static str = "orchestrator";

    /// Parse and validate an agent ID
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        validate(s)?;
        if s == Self::RESERVED {
            return Err(IdValidationError::Reserved(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

string_id!(
    /// Name of a tool registered with the gateway
    ToolName
);

impl ToolName {
    /// Parse and validate a tool name
    pub fn parse(name: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = name.as_ref();
        validate(s)?;
        Ok(Self(s.to_string()))
    }
}

/// Caller-chosen key that deduplicates retried tool calls.
///
/// Unlike the other identifiers, idempotency keys may contain `:` so that
/// derived keys such as `agent:conversation:turn:round` stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Parse and validate an idempotency key
    pub fn parse(key: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = key.as_ref();
        let without_colons = s.replace(':', "");
        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }
        if !without_colons.is_empty() {
            validate(&without_colons)?;
        }
        if s.chars().count() > MAX_ID_LENGTH * 2 {
            return Err(IdValidationError::TooLong(s.chars().count()));
        }
        Ok(Self(s.to_string()))
    }

    /// Derive the key used when a reasoner does not provide one.
    ///
    /// The key is a pure function of where the call was made, so re-issuing the
    /// same call after a crash maps onto the same gateway cache entry.
    pub fn derived(agent: &AgentId, conversation: &ConversationId, turn: u64, round: u32) -> Self {
        Self(format!("{}:{}:{}:{}", agent, conversation, turn, round))
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random identifier
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4().simple()))
            }

            /// Parse an identifier previously produced by [`Self::generate`]
            /// (or any string that passes identifier validation).
            pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
                let s = id.as_ref();
                validate(s)?;
                Ok(Self(s.to_string()))
            }

            /// Get the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdValidationError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a conversation
    ConversationId,
    "conv"
);
uuid_id!(
    /// Links a request (or turn grant) with the response it produced
    CorrelationId,
    "corr"
);
uuid_id!(
    /// Identifier of a single tool call
    ToolCallId,
    "call"
);
