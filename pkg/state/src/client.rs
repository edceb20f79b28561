use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::fmt::Display;
use std::sync::Arc;
use tracing::info;

use pkg_constants::state::EVENT_LOG_CAPACITY;

use crate::watch::{EventLog, EventType};

fn db_error<E: Display>(op: &str) -> impl FnOnce(E) -> anyhow::Error + '_ {
    move |e| anyhow::anyhow!("SlateDB {} failed: {}", op, e)
}

/// Persistent state store backed by SlateDB on a local filesystem.
///
/// Every `put`/`delete` is also published on [`EventLog`] so in-process
/// watchers see changes without polling.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    pub event_log: EventLog,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        std::fs::create_dir_all(path).map_err(|e| context(e, "create data directory", path))?;
        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| context(e, "create local object store at", path))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(db_error("open"))?;
        Ok(Self {
            db,
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
        })
    }

    /// Store a value and publish a `Put` event.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(db_error("put"))?;
        self.event_log
            .emit(EventType::Put, key.to_string(), Some(value.to_vec()))
            .await;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self.db.get(key.as_bytes()).await.map_err(db_error("get"))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    /// Delete a key and publish a `Delete` event.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(db_error("delete"))?;
        self.event_log
            .emit(EventType::Delete, key.to_string(), None)
            .await;
        Ok(())
    }

    /// All `(key, value)` pairs whose keys start with `prefix`, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(db_error("scan_prefix"))?;

        let mut results = Vec::new();
        while let Some(kv) = iter.next().await.map_err(db_error("scan_prefix"))? {
            results.push((String::from_utf8_lossy(&kv.key).to_string(), kv.value.to_vec()));
        }
        Ok(results)
    }

    /// Keys under `prefix`, without their values.
    pub async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .list_prefix(prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Flush and close the store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing SlateDB state store");
        self.db.close().await.map_err(db_error("close"))
    }
}

fn context(e: impl Display, what: &str, path: &str) -> anyhow::Error {
    anyhow::anyhow!("Failed to {} {}: {}", what, path, e)
}
