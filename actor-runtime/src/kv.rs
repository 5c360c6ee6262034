//! Key-value facade used for durable actor state.
//!
//! The runtime only consumes [`Kv`]; the store itself is injected. Two
//! backends ship with the crate: [`MemoryKv`] for tests and ephemeral hosts,
//! and [`FileKv`], a single JSON file rewritten atomically on every write.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A key made of string segments, e.g. `["actor", "state", "data"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvKey(pub Vec<String>);

impl KvKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Value>>;

    /// Missing keys are absent from the returned map.
    async fn get_batch(&self, keys: &[KvKey]) -> KvResult<HashMap<KvKey, Value>>;

    async fn put(&self, key: KvKey, value: Value) -> KvResult<()>;

    /// Writes every entry or none of them.
    async fn put_batch(&self, entries: Vec<(KvKey, Value)>) -> KvResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<KvKey, Value>>,
    writes: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put`/`put_batch` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<KvKey, Value> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn get_batch(&self, keys: &[KvKey]) -> KvResult<HashMap<KvKey, Value>> {
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    async fn put(&self, key: KvKey, value: Value) -> KvResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.write().insert(key, value);
        Ok(())
    }

    async fn put_batch(&self, entries: Vec<(KvKey, Value)>) -> KvResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.write().extend(entries);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File backend
// ─────────────────────────────────────────────────────────────────────────────

/// On-disk layout: keys are arrays, so entries are stored as pairs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileContents {
    entries: Vec<(KvKey, Value)>,
}

#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    entries: tokio::sync::Mutex<BTreeMap<KvKey, Value>>,
}

impl FileKv {
    /// Open (or lazily create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let contents: FileContents = serde_json::from_slice(&raw)?;
                contents.entries.into_iter().collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(KvError::Io(err)),
        };
        debug!(path = %path.display(), keys = entries.len(), "opened kv file");

        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<KvKey, Value>) -> KvResult<()> {
        let contents = FileContents {
            entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let raw = serde_json::to_vec(&contents)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Kv for FileKv {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn get_batch(&self, keys: &[KvKey]) -> KvResult<HashMap<KvKey, Value>> {
        let entries = self.entries.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    async fn put(&self, key: KvKey, value: Value) -> KvResult<()> {
        self.put_batch(vec![(key, value)]).await
    }

    async fn put_batch(&self, batch: Vec<(KvKey, Value)>) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        next.extend(batch);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> KvKey {
        KvKey::new(["actor", "state", name])
    }

    #[tokio::test]
    async fn test_memory_get_batch_skips_missing() {
        let kv = MemoryKv::new();
        kv.put(key("data"), json!({"count": 1})).await.unwrap();

        let got = kv.get_batch(&[key("initialized"), key("data")]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got.get(&key("data")), Some(&json!({"count": 1})));
        assert_eq!(kv.write_count(), 1);
    }

    #[tokio::test]
    async fn test_file_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kv.json");

        {
            let kv = FileKv::open(&path).await.unwrap();
            kv.put_batch(vec![
                (key("initialized"), json!(true)),
                (key("data"), json!({"count": 5})),
            ])
            .await
            .unwrap();
        }

        let kv = FileKv::open(&path).await.unwrap();
        assert_eq!(kv.get(&key("initialized")).await.unwrap(), Some(json!(true)));
        assert_eq!(kv.get(&key("data")).await.unwrap(), Some(json!({"count": 5})));
        assert_eq!(kv.get(&key("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_kv_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = FileKv::open(&path).await.unwrap_err();
        assert!(matches!(err, KvError::Encoding(_)));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("data").to_string(), "actor/state/data");
    }
}
