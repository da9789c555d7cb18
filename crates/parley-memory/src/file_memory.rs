use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use parley_core::memory::{
    MemoryKey, MemoryRecord, MemoryScope, MemoryStore, RecordIter, RecordPredicate, WriteOutcome,
};
use parley_core::{AgentId, MemoryError, MemoryOperation, MemoryResult};

use crate::in_memory::InMemoryStore;

/// Persistent memory store that syncs every record to a JSON snapshot file.
///
/// Reads and writes go through an [`InMemoryStore`] and keep its per-key
/// locking. After each mutation the whole store is written to a temporary
/// file which is then renamed over the snapshot, so the file on disk is
/// always a complete snapshot. Only the disk write itself is serialized.
///
/// # Concurrent File Access
///
/// Multiple `FileMemoryStore` instances pointing to the same path will
/// overwrite each other's snapshots. Use one instance per path.
pub struct FileMemoryStore {
    path: PathBuf,
    inner: InMemoryStore,
    persist_lock: Mutex<()>,
}

impl FileMemoryStore {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    ///
    /// A snapshot that fails to parse is copied aside to
    /// `<name>.corrupted.<unix-ts>` and the store starts fresh.
    pub fn open(path: impl Into<PathBuf>) -> MemoryResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    MemoryError::storage(
                        MemoryOperation::Restore,
                        format!("Failed to create {}: {}", parent.display(), e),
                    )
                })?;
            }
        }
        let inner = InMemoryStore::new();
        for record in Self::load_records(&path) {
            inner.write_record(record)?;
        }
        Ok(Self {
            path,
            inner,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_records(path: &Path) -> Vec<MemoryRecord> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Vec<MemoryRecord>>(&contents) {
                Ok(records) => {
                    tracing::debug!(path = ?path, records = records.len(), "Loaded memory snapshot");
                    records
                }
                Err(e) => {
                    tracing::error!(
                        path = ?path,
                        error = %e,
                        "Failed to parse memory snapshot, starting fresh"
                    );
                    if let Some(parent) = path.parent() {
                        let backup = parent.join(format!(
                            "{}.corrupted.{}",
                            path.file_name().unwrap_or_default().to_string_lossy(),
                            chrono::Utc::now().timestamp()
                        ));
                        let _ = fs::copy(path, backup);
                    }
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?path, "Memory snapshot not found, starting fresh");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Failed to read memory snapshot");
                Vec::new()
            }
        }
    }

    fn persist(&self) -> MemoryResult<()> {
        let _guard = self.persist_lock.lock().map_err(|e| {
            MemoryError::storage(MemoryOperation::Persist, format!("Lock poisoned: {}", e))
        })?;

        let mut records = self.inner.all_records();
        records.sort_by(|a, b| (&a.scope, &a.key).cmp(&(&b.scope, &b.key)));
        let json = serde_json::to_string_pretty(&records).map_err(|e| {
            tracing::error!(error = %e, "Failed to serialize memory snapshot");
            MemoryError::Serialization(e.to_string())
        })?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            tracing::error!(
                path = ?tmp_path,
                error = %e,
                "Failed to write memory snapshot to temporary file"
            );
            MemoryError::storage(
                MemoryOperation::Persist,
                format!("Failed to write to {}: {}", tmp_path.display(), e),
            )
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            tracing::error!(
                from = ?tmp_path,
                to = ?self.path,
                error = %e,
                "Failed to atomically rename memory snapshot"
            );
            MemoryError::storage(
                MemoryOperation::Persist,
                format!(
                    "Failed to rename {} to {}: {}",
                    tmp_path.display(),
                    self.path.display(),
                    e
                ),
            )
        })?;

        tracing::debug!(path = ?self.path, records = records.len(), "Persisted memory snapshot");
        Ok(())
    }
}

impl MemoryStore for FileMemoryStore {
    fn read(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        self.inner.read(scope, key)
    }

    fn write_record(&self, record: MemoryRecord) -> MemoryResult<WriteOutcome> {
        let outcome = self.inner.write_record(record)?;
        if outcome == WriteOutcome::Applied {
            self.persist()?;
        }
        Ok(outcome)
    }

    fn query(
        &self,
        scope: &MemoryScope,
        predicate: RecordPredicate,
    ) -> MemoryResult<RecordIter<'_>> {
        self.inner.query(scope, predicate)
    }

    fn modify(
        &self,
        scope: &MemoryScope,
        key: &MemoryKey,
        writer: &AgentId,
        f: &mut dyn FnMut(Option<&Value>) -> Value,
    ) -> MemoryResult<MemoryRecord> {
        let record = self.inner.modify(scope, key, writer, f)?;
        self.persist()?;
        Ok(record)
    }

    fn remove(&self, scope: &MemoryScope, key: &MemoryKey) -> MemoryResult<Option<MemoryRecord>> {
        let removed = self.inner.remove(scope, key)?;
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    fn drop_scope(&self, scope: &MemoryScope) -> MemoryResult<usize> {
        let dropped = self.inner.drop_scope(scope)?;
        if dropped > 0 {
            self.persist()?;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ConversationId;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let agent = AgentId::parse("a").unwrap();
        let key = MemoryKey::new("runtime.continuation").unwrap();
        let scope = MemoryScope::Private(agent.clone());

        {
            let store = FileMemoryStore::open(&path).unwrap();
            store.write(&scope, &key, json!({"tool": "search"}), &agent).unwrap();
        }

        let reopened = FileMemoryStore::open(&path).unwrap();
        let record = reopened.read(&scope, &key).unwrap().unwrap();
        assert_eq!(record.value, json!({"tool": "search"}));
        assert_eq!(record.writer, agent);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn removal_and_scope_drop_are_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.json");
        let agent = AgentId::parse("a").unwrap();
        let shared = MemoryScope::Shared(ConversationId::generate());
        let private = MemoryScope::Private(agent.clone());
        let key = MemoryKey::new("k").unwrap();

        let store = FileMemoryStore::open(&path).unwrap();
        store.write(&shared, &key, json!(1), &agent).unwrap();
        store.write(&private, &key, json!(2), &agent).unwrap();
        store.drop_scope(&shared).unwrap();
        store.remove(&private, &key).unwrap();
        drop(store);

        let reopened = FileMemoryStore::open(&path).unwrap();
        assert!(reopened.read(&shared, &key).unwrap().is_none());
        assert!(reopened.read(&private, &key).unwrap().is_none());
    }

    #[test]
    fn corrupted_snapshot_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileMemoryStore::open(&path).unwrap();
        let scope = MemoryScope::Shared(ConversationId::generate());
        assert_eq!(store.query(&scope, Box::new(|_| true)).unwrap().count(), 0);

        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupted."))
            .count();
        assert_eq!(backups, 1);
    }
}
