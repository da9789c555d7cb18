//! Memory model: validated keys, scopes, records and the store trait.
//!
//! Two kinds of scope exist. A private scope belongs to one agent and only
//! that agent writes it. A shared scope belongs to a conversation; concurrent
//! writers resolve by last-write-wins on `(timestamp, writer)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MemoryError, MemoryResult};
use crate::identifiers::{AgentId, ConversationId};

/// Validated memory key.
///
/// Keys are 1 to 128 characters of alphanumerics, `_`, `-`, `.` and `:`.
///
/// ```
/// use parley_core::MemoryKey;
///
/// let key = MemoryKey::new("notes.last_turn").unwrap();
/// assert_eq!(key.as_str(), "notes.last_turn");
/// assert!(MemoryKey::new("has space").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryKey(String);

/// Errors that can occur when creating a `MemoryKey`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMemoryKey {
    /// Memory key is empty or contains only whitespace.
    #[error("Memory key cannot be empty")]
    Empty,
    /// Memory key exceeds the maximum allowed length.
    #[error("Memory key too long: {0} characters (max 128)")]
    TooLong(usize),
    /// Memory key contains invalid characters.
    #[error("Memory key contains invalid characters: '{0}'")]
    InvalidChars(String),
}

impl MemoryKey {
    /// Maximum allowed length for memory keys.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new validated memory key.
    pub fn new(key: &str) -> Result<Self, InvalidMemoryKey> {
        if key.trim().is_empty() {
            return Err(InvalidMemoryKey::Empty);
        }
        let len = key.chars().count();
        if len > Self::MAX_LENGTH {
            return Err(InvalidMemoryKey::TooLong(len));
        }
        if !key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return Err(InvalidMemoryKey::InvalidChars(key.to_string()));
        }
        Ok(MemoryKey(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MemoryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for MemoryKey {
    type Error = InvalidMemoryKey;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

impl TryFrom<String> for MemoryKey {
    type Error = InvalidMemoryKey;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::new(&key)
    }
}

impl From<MemoryKey> for String {
    fn from(key: MemoryKey) -> Self {
        key.0
    }
}

/// Well-known keys written by the runtime itself
pub struct MemoryKeys;

impl MemoryKeys {
    /// Pending tool call saved while the runtime awaits the gateway
    pub fn continuation() -> MemoryKey {
        MemoryKey("runtime.continuation".to_string())
    }

    /// Outcome of the agent's most recent turn
    pub fn last_outcome() -> MemoryKey {
        MemoryKey("runtime.last_outcome".to_string())
    }

    /// Most recent tool failure the runtime reflected on
    pub fn last_tool_failure() -> MemoryKey {
        MemoryKey("runtime.last_tool_failure".to_string())
    }
}

/// Where a record lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "owner")]
pub enum MemoryScope {
    /// Working memory of one agent
    Private(AgentId),
    /// Store shared by all participants of a conversation
    Shared(ConversationId),
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryScope::Private(agent) => write!(f, "private:{}", agent),
            MemoryScope::Shared(conversation) => write!(f, "shared:{}", conversation),
        }
    }
}

/// A stored value together with who wrote it and when
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub scope: MemoryScope,
    pub key: MemoryKey,
    pub value: Value,
    pub writer: AgentId,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Build a record stamped with the current time
    pub fn new(scope: MemoryScope, key: MemoryKey, value: Value, writer: AgentId) -> Self {
        Self {
            scope,
            key,
            value,
            writer,
            timestamp: Utc::now(),
        }
    }

    /// Whether this record wins over `current` under last-write-wins.
    ///
    /// Ties on timestamp are broken by writer id; an identical
    /// `(timestamp, writer)` pair is a replay of the same write and applies.
    pub fn supersedes(&self, current: &MemoryRecord) -> bool {
        (self.timestamp, &self.writer) >= (current.timestamp, &current.writer)
    }

    /// Reject writes to a private scope by anyone but its owner
    pub fn check_writer(&self) -> MemoryResult<()> {
        match &self.scope {
            MemoryScope::Private(owner) if owner != &self.writer => {
                Err(MemoryError::PrivateScopeViolation {
                    owner: owner.clone(),
                    writer: self.writer.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Result of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// The record was stored
    Applied,
    /// A newer record already exists; nothing changed
    Stale,
}

/// Lazy iterator over records returned by [`MemoryStore::query`]
pub type RecordIter<'a> = Box<dyn Iterator<Item = MemoryRecord> + Send + 'a>;

/// Predicate used to filter a query
pub type RecordPredicate = Box<dyn Fn(&MemoryRecord) -> bool + Send + Sync>;

/// Storage backend for agent and conversation memory.
///
/// Implementations lock per key only. No operation may take a lock that
/// spans scopes.
pub trait MemoryStore: Send + Sync {
    /// Read a single record
    fn read(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>>;

    /// Store a fully formed record under last-write-wins
    fn write_record(&self, record: MemoryRecord) -> MemoryResult<WriteOutcome>;

    /// Store `value`, stamped now
    fn write(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        value: Value,
        writer: &AgentId,
    ) -> MemoryResult<WriteOutcome> {
        self.write_record(MemoryRecord::new(
            scope.clone(),
            key.clone(),
            value,
            writer.clone(),
        ))
    }

    /// Records in `scope` matching `predicate`, fetched as the iterator advances
    fn query(&self, scope: &MemoryScope, predicate: RecordPredicate)
    -> MemoryResult<RecordIter<'_>>;

    /// Atomically replace the value under `key` with `f(current)`.
    ///
    /// The key stays locked while `f` runs, so concurrent modifications of the
    /// same key serialize instead of overwriting each other.
    fn modify(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        writer: &AgentId,
        f: &mut dyn FnMut(Option<&Value>) -> Value,
    ) -> MemoryResult<MemoryRecord>;

    /// Delete one record, returning it if it existed
    fn remove(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>>;

    /// Delete a whole scope, returning how many records it held
    fn drop_scope(&self, scope: &MemoryScope) -> MemoryResult<usize>;
}

/// Records visible to an agent while it reasons
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub private: Vec<MemoryRecord>,
    pub shared: Vec<MemoryRecord>,
}

impl MemorySnapshot {
    /// Look up a private value by key
    pub fn private_value(&self, key: &str) -> Option<&Value> {
        self.private
            .iter()
            .find(|r| r.key.as_str() == key)
            .map(|r| &r.value)
    }

    /// Look up a shared value by key
    pub fn shared_value(&self, key: &str) -> Option<&Value> {
        self.shared
            .iter()
            .find(|r| r.key.as_str() == key)
            .map(|r| &r.value)
    }
}

/// Memory handle given to one agent runtime.
///
/// The handle can only write its owner's private scope, which is how the
/// single-writer rule for private memory is enforced.
#[derive(Clone)]
pub struct AgentMemory {
    owner: AgentId,
    store: Arc<dyn MemoryStore>,
}

impl AgentMemory {
    pub fn new(owner: AgentId, store: Arc<dyn MemoryStore>) -> Self {
        Self { owner, store }
    }

    pub fn owner(&self) -> &AgentId {
        &self.owner
    }

    fn private_scope(&self) -> MemoryScope {
        MemoryScope::Private(self.owner.clone())
    }

    pub fn read_private(&self, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        self.store.read(&self.private_scope(), key)
    }

    pub fn write_private(&self, key: &MemoryKey, value: Value) -> MemoryResult<WriteOutcome> {
        self.store
            .write(&self.private_scope(), key, value, &self.owner)
    }

    pub fn remove_private(&self, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        self.store.remove(&self.private_scope(), key)
    }

    pub fn read_shared(
        &self,
        conversation: &ConversationId,
        key: &MemoryKey,
    ) -> MemoryResult<Option<MemoryRecord>> {
        self.store
            .read(&MemoryScope::Shared(conversation.clone()), key)
    }

    pub fn write_shared(
        &self,
        conversation: &ConversationId,
        key: &MemoryKey,
        value: Value,
    ) -> MemoryResult<WriteOutcome> {
        self.store.write(
            &MemoryScope::Shared(conversation.clone()),
            key,
            value,
            &self.owner,
        )
    }

    /// Read-modify-write a shared key atomically
    pub fn modify_shared(
        &self,
        conversation: &ConversationId,
        key: &MemoryKey,
        f: &mut dyn FnMut(Option<&Value>) -> Value,
    ) -> MemoryResult<MemoryRecord> {
        self.store.modify(
            &MemoryScope::Shared(conversation.clone()),
            key,
            &self.owner,
            f,
        )
    }

    /// Everything this agent may see while reasoning in `conversation`
    pub fn snapshot(&self, conversation: &ConversationId) -> MemoryResult<MemorySnapshot> {
        let mut private: Vec<_> = self
            .store
            .query(&self.private_scope(), Box::new(|_| true))?
            .collect();
        let mut shared: Vec<_> = self
            .store
            .query(
                &MemoryScope::Shared(conversation.clone()),
                Box::new(|_| true),
            )?
            .collect();
        private.sort_by(|a, b| a.key.cmp(&b.key));
        shared.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(MemorySnapshot { private, shared })
    }
}

impl std::fmt::Debug for AgentMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMemory")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
