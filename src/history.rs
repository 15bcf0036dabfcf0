//! history.rs: per-topic run history behind the `HistoryStore` seam.
//!
//! Entries for a topic are kept in ascending `run_id` order and capped; the oldest are
//! drained first. Re-putting the latest `run_id` replaces that entry so a retried run
//! does not duplicate history. Appending an older `run_id` is rejected.
//!
//! Topics whose latest entry falls behind the history horizon are removed with `prune`,
//! which keeps the set of listed topics, and therefore per-run reads, bounded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{HistoryEntry, RunId};

pub const DEFAULT_HISTORY_CAP: usize = 32;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Entries for `topic_id`, ascending by run id. Unknown topics yield an empty vec.
    async fn get(&self, topic_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn put(&self, topic_id: &str, entry: HistoryEntry) -> Result<(), StoreError>;

    /// Every topic id with stored history.
    async fn topic_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Drop topics whose latest entry is older than `before`. Returns how many were removed.
    async fn prune(&self, before: RunId) -> Result<usize, StoreError>;
}

/// Highest run id recorded anywhere in the store. Unreadable topics are skipped.
pub async fn latest_run_id(store: &dyn HistoryStore) -> Result<Option<RunId>, StoreError> {
    let mut latest = None;
    for id in store.topic_ids().await? {
        match store.get(&id).await {
            Ok(entries) => {
                if let Some(last) = entries.last() {
                    latest = latest.max(Some(last.run_id));
                }
            }
            Err(e) => {
                tracing::warn!(target: "history", topic_id = %id, error = %e, "unreadable history skipped");
            }
        }
    }
    Ok(latest)
}

fn append_capped(
    entries: &mut Vec<HistoryEntry>,
    mut entry: HistoryEntry,
    cap: usize,
) -> Result<(), StoreError> {
    let first_seen = entries
        .first()
        .map_or(entry.first_seen(), |e| e.first_seen().min(entry.first_seen()));
    entry.first_seen_run = Some(first_seen);

    match entries.last() {
        Some(last) if last.run_id == entry.run_id => {
            let idx = entries.len() - 1;
            entries[idx] = entry;
        }
        Some(last) if last.run_id > entry.run_id => {
            return Err(StoreError::OutOfOrder {
                latest: last.run_id,
                got: entry.run_id,
            });
        }
        _ => entries.push(entry),
    }
    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(0..excess);
    }
    Ok(())
}

/// Process-local store for tests and embedding.
#[derive(Debug)]
pub struct MemoryHistory {
    inner: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    cap: usize,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAP)
    }
}

impl MemoryHistory {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<HistoryEntry>>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("history mutex poisoned".into()))
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn get(&self, topic_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.lock()?.get(topic_id).cloned().unwrap_or_default())
    }

    async fn put(&self, topic_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        append_capped(map.entry(topic_id.to_string()).or_default(), entry, self.cap)
    }

    async fn topic_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn prune(&self, before: RunId) -> Result<usize, StoreError> {
        let mut map = self.lock()?;
        let len = map.len();
        map.retain(|_, entries| entries.last().is_some_and(|e| e.run_id >= before));
        Ok(len - map.len())
    }
}

/// One JSON file per topic: `<dir>/<topic_id>.json`, rewritten via temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFileHistory {
    dir: PathBuf,
    cap: usize,
}

impl JsonFileHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cap: DEFAULT_HISTORY_CAP,
        }
    }

    pub fn with_capacity(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, topic_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !topic_id.is_empty()
            && topic_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Unavailable(format!(
                "topic id `{topic_id}` is not a valid file name"
            )));
        }
        Ok(self.dir.join(format!("{topic_id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Vec<HistoryEntry>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistory {
    async fn get(&self, topic_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let path = self.path_for(topic_id)?;
        self.read(&path).await
    }

    async fn put(&self, topic_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        let path = self.path_for(topic_id)?;
        let mut entries = self.read(&path).await?;
        append_capped(&mut entries, entry, self.cap)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&entries)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn topic_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(de) = rd.next_entry().await? {
            let path = de.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn prune(&self, before: RunId) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in self.topic_ids().await? {
            let path = self.path_for(&id)?;
            let stale = match self.read(&path).await {
                Ok(entries) => entries.last().map_or(true, |e| e.run_id < before),
                Err(e) => {
                    tracing::warn!(target: "history", topic_id = %id, error = %e, "unreadable history kept");
                    false
                }
            };
            if stale {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
