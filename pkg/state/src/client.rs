use crate::watch::{EventLog, EventType};
use serde::{Deserialize, Serialize};
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Errors from the versioned write path.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected version {expected}, store has {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Envelope wrapping versioned documents. The version token is issued by the
/// store and bumped on every write; callers use it for optimistic concurrency.
#[derive(Serialize, Deserialize)]
struct VersionedEnvelope {
    version: u64,
    object: serde_json::Value,
}

/// Persistent state store backed by SlateDB on a local filesystem.
/// In production this would use S3/R2/MinIO via the `object_store` crate.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    pub event_log: EventLog,
    /// SlateDB has no compare-and-swap, so versioned read-check-write cycles
    /// are serialized through this gate.
    write_gate: Arc<Mutex<()>>,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            event_log: EventLog::new(),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Open a store backed by an in-memory object store. Test use only.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        let db = Db::open(Path::from("/"), Arc::new(InMemory::new()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db,
            event_log: EventLog::new(),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Store a value under the given key.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let prior = self.get(key).await?;
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?;
        self.event_log
            .emit(EventType::Put, key.to_string(), Some(value.to_vec()), prior);
        Ok(())
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
        }
    }

    /// Delete a key from the store.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let prior = self.get(key).await?;
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?;
        self.event_log
            .emit(EventType::Delete, key.to_string(), None, prior);
        Ok(())
    }

    /// List all key-value pairs whose keys start with `prefix`.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    /// Read a versioned document: `(object_bytes, version)`.
    pub async fn get_versioned(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, u64)>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        let envelope: VersionedEnvelope = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("corrupt envelope at {}: {}", key, e))?;
        let object = serde_json::to_vec(&envelope.object)?;
        Ok(Some((object, envelope.version)))
    }

    /// List versioned documents under a prefix as `(key, object_bytes, version)`.
    /// Entries that do not parse as envelopes are skipped.
    pub async fn list_versioned(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>, u64)>> {
        let mut results = Vec::new();
        for (key, raw) in self.list_prefix(prefix).await? {
            let Ok(envelope) = serde_json::from_slice::<VersionedEnvelope>(&raw) else {
                continue;
            };
            let object = serde_json::to_vec(&envelope.object)?;
            results.push((key, object, envelope.version));
        }
        Ok(results)
    }

    /// Write a versioned document. With `expected = Some(v)` the write only
    /// succeeds if the stored version is still `v` (optimistic concurrency);
    /// `None` creates or overwrites unconditionally. Returns the new version.
    pub async fn put_versioned(
        &self,
        key: &str,
        object: &[u8],
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let _gate = self.write_gate.lock().await;

        let current = self.get_versioned(key).await?;
        let actual = current.as_ref().map(|(_, v)| *v).unwrap_or(0);
        if let Some(expected) = expected
            && expected != actual
        {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let version = actual + 1;
        let envelope = VersionedEnvelope {
            version,
            object: serde_json::from_slice(object)
                .map_err(|e| anyhow::anyhow!("value at {} is not JSON: {}", key, e))?,
        };
        let raw = serde_json::to_vec(&envelope).map_err(anyhow::Error::from)?;
        self.db
            .put(key.as_bytes(), &raw)
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?;

        self.event_log.emit(
            EventType::Put,
            key.to_string(),
            Some(object.to_vec()),
            current.map(|(bytes, _)| bytes),
        );
        Ok(version)
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}
