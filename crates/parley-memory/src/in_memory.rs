use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use parley_core::memory::{
    MemoryKey, MemoryRecord, MemoryScope, MemoryStore, RecordIter, RecordPredicate, WriteOutcome,
};
use parley_core::{AgentId, MemoryError, MemoryResult};

type ScopeMap = Arc<DashMap<MemoryKey, MemoryRecord>>;

/// Fast, transient memory store backed by sharded concurrent maps.
///
/// Each scope has its own map and every operation locks a single key's shard,
/// so writers to different keys never wait on each other. All data is lost
/// when the process terminates.
///
/// # Example
///
/// ```rust
/// use parley_core::{AgentId, ConversationId, MemoryKey, MemoryScope, MemoryStore, WriteOutcome};
/// use parley_memory::InMemoryStore;
/// use serde_json::json;
///
/// let store = InMemoryStore::new();
/// let scope = MemoryScope::Shared(ConversationId::generate());
/// let key = MemoryKey::new("topic").unwrap();
/// let writer = AgentId::parse("planner").unwrap();
///
/// assert_eq!(store.write(&scope, &key, json!("pricing"), &writer).unwrap(), WriteOutcome::Applied);
/// assert_eq!(store.read(&scope, &key).unwrap().unwrap().value, json!("pricing"));
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    scopes: DashMap<MemoryScope, ScopeMap>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, scope: &MemoryScope) -> Option<ScopeMap> {
        self.scopes.get(scope).map(|map| Arc::clone(map.value()))
    }

    fn scope_or_create(&self, scope: &MemoryScope) -> ScopeMap {
        Arc::clone(self.scopes.entry(scope.clone()).or_default().value())
    }

    /// Every record in the store, for snapshotting
    pub(crate) fn all_records(&self) -> Vec<MemoryRecord> {
        let maps: Vec<ScopeMap> = self
            .scopes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        maps.iter()
            .flat_map(|map| {
                map.iter()
                    .map(|entry| entry.value().clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of scopes currently holding data
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

impl MemoryStore for InMemoryStore {
    fn read(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        Ok(self
            .scope(scope)
            .and_then(|map| map.get(key).map(|record| record.value().clone())))
    }

    fn write_record(&self, record: MemoryRecord) -> MemoryResult<WriteOutcome> {
        record.check_writer()?;
        let map = self.scope_or_create(&record.scope);
        match map.entry(record.key.clone()) {
            Entry::Occupied(mut current) => {
                if record.supersedes(current.get()) {
                    current.insert(record);
                    Ok(WriteOutcome::Applied)
                } else {
                    tracing::debug!(
                        scope = %record.scope,
                        key = %record.key,
                        writer = %record.writer,
                        "Ignoring stale memory write"
                    );
                    Ok(WriteOutcome::Stale)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(WriteOutcome::Applied)
            }
        }
    }

    fn query(
        &self,
        scope: &MemoryScope,
        predicate: RecordPredicate,
    ) -> MemoryResult<RecordIter<'_>> {
        let Some(map) = self.scope(scope) else {
            return Ok(Box::new(std::iter::empty()));
        };
        // Only keys are collected up front; records are cloned as the caller advances.
        let keys: Vec<MemoryKey> = map.iter().map(|entry| entry.key().clone()).collect();
        Ok(Box::new(
            keys.into_iter()
                .filter_map(move |key| map.get(&key).map(|record| record.value().clone()))
                .filter(move |record| predicate(record)),
        ))
    }

    fn modify(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        writer: &AgentId,
        f: &mut dyn FnMut(Option<&Value>) -> Value,
    ) -> MemoryResult<MemoryRecord> {
        if let MemoryScope::Private(owner) = scope {
            if owner != writer {
                return Err(MemoryError::PrivateScopeViolation {
                    owner: owner.clone(),
                    writer: writer.clone(),
                });
            }
        }
        let map = self.scope_or_create(scope);
        let record = match map.entry(key.clone()) {
            Entry::Occupied(mut current) => {
                let value = f(Some(&current.get().value));
                let mut record = MemoryRecord::new(scope.clone(), key.clone(), value, writer.clone());
                // keep the key's timestamps monotonic for later LWW comparisons
                record.timestamp = record.timestamp.max(current.get().timestamp);
                current.insert(record.clone());
                record
            }
            Entry::Vacant(slot) => {
                let value = f(None);
                let record = MemoryRecord::new(scope.clone(), key.clone(), value, writer.clone());
                slot.insert(record.clone());
                record
            }
        };
        Ok(record)
    }

    fn remove(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        Ok(self
            .scope(scope)
            .and_then(|map| map.remove(key).map(|(_, record)| record)))
    }

    fn drop_scope(&self, scope: &MemoryScope) -> MemoryResult<usize> {
        let dropped = self
            .scopes
            .remove(scope)
            .map(|(_, map)| map.len())
            .unwrap_or(0);
        tracing::debug!(scope = %scope, records = dropped, "Dropped memory scope");
        Ok(dropped)
    }
}
