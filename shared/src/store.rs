//! Durable storage for queue entries.
//!
//! The queue is the only writer. Every implementation keeps entries encoded
//! and decodes them one at a time in [`OperationStore::list_all`], so a single
//! unreadable entry is reported per-entry and can be quarantined without
//! failing recovery.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;
use crate::operation::{OpId, Operation};

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Result<Operation, StoreError>>, StoreError>;
    async fn get(&self, id: &OpId) -> Result<Option<Operation>, StoreError>;
    /// Insert or replace, atomically.
    async fn put(&self, op: &Operation) -> Result<(), StoreError>;
    async fn put_batch(&self, ops: &[Operation]) -> Result<(), StoreError>;
    async fn delete(&self, id: &OpId) -> Result<Option<Operation>, StoreError>;
}

pub(crate) fn encode_entry(op: &Operation) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(op)?)
}

/// Decode and re-validate one stored entry.
pub(crate) fn decode_entry(id: &str, data: &[u8]) -> Result<Operation, StoreError> {
    let corrupted = |reason: String| StoreError::CorruptedEntry {
        id: id.to_string(),
        reason,
    };
    let op: Operation = serde_json::from_slice(data).map_err(|e| corrupted(e.to_string()))?;
    if op.id.as_str() != id {
        return Err(corrupted(format!("stored under {id} but has id {}", op.id)));
    }
    if op.kind != op.payload.kind() {
        return Err(corrupted("kind does not match payload".into()));
    }
    op.payload
        .validate()
        .map_err(|e| corrupted(e.to_string()))?;
    Ok(op)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::LockPoisoned)
}

// ============================================================================
// Memory
// ============================================================================

/// Ephemeral store. Entries are held encoded, as a durable store would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write raw bytes under `id`, bypassing encoding.
    pub fn insert_raw(&self, id: impl Into<String>, data: Vec<u8>) -> Result<(), StoreError> {
        lock(&self.entries)?.insert(id.into(), data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<Result<Operation, StoreError>>, StoreError> {
        let entries = lock(&self.entries)?;
        Ok(entries
            .iter()
            .map(|(id, data)| decode_entry(id, data))
            .collect())
    }

    async fn get(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
        let entries = lock(&self.entries)?;
        entries
            .get(id.as_str())
            .map(|data| decode_entry(id.as_str(), data))
            .transpose()
    }

    async fn put(&self, op: &Operation) -> Result<(), StoreError> {
        let data = encode_entry(op)?;
        lock(&self.entries)?.insert(op.id.as_str().to_string(), data);
        Ok(())
    }

    async fn put_batch(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let encoded = ops
            .iter()
            .map(|op| Ok((op.id.as_str().to_string(), encode_entry(op)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        lock(&self.entries)?.extend(encoded);
        Ok(())
    }

    async fn delete(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
        let removed = lock(&self.entries)?.remove(id.as_str());
        removed
            .map(|data| decode_entry(id.as_str(), &data))
            .transpose()
    }
}

// ============================================================================
// SQLite
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use tracing::info;

    use super::{decode_entry, encode_entry, lock, OperationStore};
    use crate::error::StoreError;
    use crate::operation::{OpId, Operation};

    const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS operations (
            op_id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            data BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_operations_key ON operations(idempotency_key);
        CREATE INDEX IF NOT EXISTS idx_operations_priority ON operations(priority DESC, created_at ASC);
    "#;

    const UPSERT: &str = r#"
        INSERT INTO operations (op_id, idempotency_key, kind, status, priority, created_at, data)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(op_id) DO UPDATE SET
            status = excluded.status,
            priority = excluded.priority,
            data = excluded.data
    "#;

    /// One row per operation with the full entry in a JSON `data` column.
    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let conn = Connection::open(path.as_ref())?;
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.pragma_update(None, "synchronous", "FULL")?;
            Self::init(conn)
        }

        pub fn in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(SCHEMA)?;
            info!("sqlite operation store ready");
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn upsert(conn: &Connection, op: &Operation) -> Result<(), StoreError> {
            let data = encode_entry(op)?;
            conn.execute(
                UPSERT,
                params![
                    op.id.as_str(),
                    op.idempotency_key.as_str(),
                    op.kind.as_str(),
                    op.status.name(),
                    i64::from(op.priority),
                    op.created_at.0 as i64,
                    data,
                ],
            )?;
            Ok(())
        }

        /// Overwrite a row's data column as-is.
        pub fn write_raw(&self, id: &str, data: &[u8]) -> Result<(), StoreError> {
            let conn = lock(&self.conn)?;
            conn.execute(
                "UPDATE operations SET data = ?1 WHERE op_id = ?2",
                params![data, id],
            )?;
            Ok(())
        }
    }

    #[async_trait]
    impl OperationStore for SqliteStore {
        async fn list_all(&self) -> Result<Vec<Result<Operation, StoreError>>, StoreError> {
            let conn = lock(&self.conn)?;
            let mut stmt = conn
                .prepare("SELECT op_id, data FROM operations ORDER BY priority DESC, created_at ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(id, data)| decode_entry(&id, &data))
                .collect())
        }

        async fn get(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
            let conn = lock(&self.conn)?;
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM operations WHERE op_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| decode_entry(id.as_str(), &d)).transpose()
        }

        async fn put(&self, op: &Operation) -> Result<(), StoreError> {
            let conn = lock(&self.conn)?;
            Self::upsert(&conn, op)
        }

        async fn put_batch(&self, ops: &[Operation]) -> Result<(), StoreError> {
            let mut conn = lock(&self.conn)?;
            let tx = conn.transaction()?;
            for op in ops {
                Self::upsert(&tx, op)?;
            }
            tx.commit()?;
            Ok(())
        }

        async fn delete(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
            let conn = lock(&self.conn)?;
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "DELETE FROM operations WHERE op_id = ?1 RETURNING data",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| decode_entry(id.as_str(), &d)).transpose()
        }
    }
}

// ============================================================================
// Snapshot file
// ============================================================================

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
const SNAPSHOT_MAGIC: &[u8; 4] = b"OPSQ";
const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SnapshotPayload {
    entries: BTreeMap<String, Vec<u8>>,
}

/// Whole-queue snapshot, rewritten on every mutation.
///
/// Suited to small queues on platforms without SQLite. The file is a CBOR
/// envelope (magic, schema version, blake3 checksum) around the encoded
/// entries; writes go to a temp file that is fsynced and renamed over the
/// previous snapshot.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl SnapshotStore {
    /// Load `path`, or start empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                return Err(StoreError::Corrupted {
                    reason: "empty file",
                });
            }
            Self::decode(&bytes)?.entries
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, StoreError> {
        let payload = SnapshotPayload {
            entries: entries.clone(),
        };
        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);
        let envelope = SnapshotEnvelope {
            magic: *SNAPSHOT_MAGIC,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<SnapshotPayload, StoreError> {
        if bytes.len() > MAX_SNAPSHOT_BYTES {
            return Err(StoreError::Corrupted {
                reason: "snapshot exceeds size limit",
            });
        }

        let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;
        if envelope.magic != *SNAPSHOT_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: SNAPSHOT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(ciborium::from_reader(&envelope.payload[..])?)
    }

    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let bytes = Self::encode(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                if let Err(e) = dir.sync_all() {
                    warn!(path = %parent.display(), error = %e, "failed to sync snapshot directory");
                }
            }
        }
        Ok(())
    }

    /// Apply `change` to a copy and swap it in only once it is on disk.
    fn mutate<R>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> R,
    ) -> Result<R, StoreError> {
        let mut entries = lock(&self.entries)?;
        let mut next = entries.clone();
        let result = change(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(result)
    }
}

#[async_trait]
impl OperationStore for SnapshotStore {
    async fn list_all(&self) -> Result<Vec<Result<Operation, StoreError>>, StoreError> {
        let entries = lock(&self.entries)?;
        Ok(entries
            .iter()
            .map(|(id, data)| decode_entry(id, data))
            .collect())
    }

    async fn get(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
        let entries = lock(&self.entries)?;
        entries
            .get(id.as_str())
            .map(|data| decode_entry(id.as_str(), data))
            .transpose()
    }

    async fn put(&self, op: &Operation) -> Result<(), StoreError> {
        let data = encode_entry(op)?;
        let id = op.id.as_str().to_string();
        self.mutate(|entries| {
            entries.insert(id, data);
        })
    }

    async fn put_batch(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let encoded = ops
            .iter()
            .map(|op| Ok((op.id.as_str().to_string(), encode_entry(op)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.mutate(|entries| entries.extend(encoded))
    }

    async fn delete(&self, id: &OpId) -> Result<Option<Operation>, StoreError> {
        let removed = self.mutate(|entries| entries.remove(id.as_str()))?;
        removed
            .map(|data| decode_entry(id.as_str(), &data))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ActorId, IdempotencyKey, OperationPayload, OperationStatus, UnixTimeMs};
    use tempfile::tempdir;

    fn sample(n: u64) -> Operation {
        let payload = OperationPayload::CreateMatch {
            initiator: ActorId::new("alice").unwrap(),
            counterpart: ActorId::new(format!("peer-{n}")).unwrap(),
        };
        let key = IdempotencyKey::new(format!("create_match_{n}")).unwrap();
        Operation::new(payload, key, 8, n, UnixTimeMs(1_700_000_000_000 + n))
    }

    async fn exercise(store: &dyn OperationStore) {
        let a = sample(1);
        let mut b = sample(2);
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        b.status = OperationStatus::InFlight;
        b.attempt = 1;
        store.put(&b).await.unwrap();
        assert_eq!(store.get(&b.id).await.unwrap().unwrap(), b);

        let all: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(store.delete(&a.id).await.unwrap().unwrap(), a);
        assert!(store.get(&a.id).await.unwrap().is_none());
        assert!(store.delete(&a.id).await.unwrap().is_none());

        let batch = vec![sample(3), sample(4)];
        store.put_batch(&batch).await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        exercise(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn snapshot_store_contract() {
        let dir = tempdir().unwrap();
        exercise(&SnapshotStore::open(dir.path().join("queue.snap")).unwrap()).await;
    }

    #[tokio::test]
    async fn memory_store_reports_corrupt_entries_individually() {
        let store = MemoryStore::new();
        store.put(&sample(1)).await.unwrap();
        store.insert_raw("broken", b"{not json".to_vec()).unwrap();

        let loaded = store.list_all().await.unwrap();
        assert_eq!(loaded.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(loaded.iter().any(|r| matches!(
            r,
            Err(StoreError::CorruptedEntry { id, .. }) if id == "broken"
        )));
    }

    #[test]
    fn decode_rejects_mismatched_id() {
        let op = sample(1);
        let data = encode_entry(&op).unwrap();
        assert!(matches!(
            decode_entry("someone-else", &data),
            Err(StoreError::CorruptedEntry { .. })
        ));
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let op = sample(7);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&op).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(&op.id).await.unwrap().unwrap(), op);
    }

    #[tokio::test]
    async fn sqlite_store_quarantines_bad_row() {
        let store = SqliteStore::in_memory().unwrap();
        let op = sample(1);
        store.put(&op).await.unwrap();
        store.write_raw(op.id.as_str(), b"garbage").unwrap();
        let loaded = store.list_all().await.unwrap();
        assert!(matches!(loaded[0], Err(StoreError::CorruptedEntry { .. })));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen_and_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.snap");
        let op = sample(5);
        {
            let store = SnapshotStore::open(&path).unwrap();
            store.put(&op).await.unwrap();
        }
        assert!(!path.with_extension("tmp").exists());

        let store = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.get(&op.id).await.unwrap().unwrap(), op);
    }

    #[tokio::test]
    async fn snapshot_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.snap");
        SnapshotStore::open(&path)
            .unwrap()
            .put(&sample(1))
            .await
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(SnapshotStore::open(&path).is_err());
    }

    #[test]
    fn snapshot_rejects_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.snap");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            SnapshotStore::open(&path),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn snapshot_rejects_future_schema() {
        let payload = SnapshotPayload::default();
        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes).unwrap();
        let envelope = SnapshotEnvelope {
            magic: *SNAPSHOT_MAGIC,
            schema_version: SNAPSHOT_SCHEMA_VERSION + 1,
            checksum: *blake3::hash(&payload_bytes).as_bytes(),
            payload: payload_bytes,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        assert!(matches!(
            SnapshotStore::decode(&bytes),
            Err(StoreError::FutureSchema { .. })
        ));
    }
}
