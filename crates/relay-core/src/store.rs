//! Document store: named JSON documents behind a load/save contract.
//!
//! The store itself gives no multi-call atomicity. Every read-modify-write
//! goes through [`Documents::update`], which holds a per-key async mutex
//! around load + mutate + save so concurrent writers for the same document
//! are serialized.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{errors::Error, Result};

/// Raw key-value document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the document does not exist.
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn save(&self, key: &str, doc: &serde_json::Value) -> Result<()>;
}

/// One pretty-printed JSON file per key under `dir`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        let txt = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&txt).map_err(|e| Error::Persistence {
            key: key.to_string(),
            reason: format!("corrupt document {}: {e}", path.display()),
        })?;
        Ok(Some(value))
    }

    async fn save(&self, key: &str, doc: &serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let txt = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&tmp, txt).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory store (tests, dry runs).
#[derive(Default)]
pub struct MemoryStore {
    docs: std::sync::Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let docs = self
            .docs
            .lock()
            .map_err(|_| Error::Persistence {
                key: key.to_string(),
                reason: "memory store poisoned".to_string(),
            })?;
        Ok(docs.get(key).cloned())
    }

    async fn save(&self, key: &str, doc: &serde_json::Value) -> Result<()> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|_| Error::Persistence {
                key: key.to_string(),
                reason: "memory store poisoned".to_string(),
            })?;
        docs.insert(key.to_string(), doc.clone());
        Ok(())
    }
}

/// Per-key async mutexes. Entries are never evicted; the key space is
/// bounded by the number of users.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Typed access to the document store with per-key serialized updates.
#[derive(Clone)]
pub struct Documents {
    store: Arc<dyn DocumentStore>,
    locks: Arc<KeyLocks>,
}

impl Documents {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Strict typed load: missing → `T::default()`, unreadable → error.
    pub async fn load<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.store.load(key).await? {
            None => Ok(T::default()),
            Some(v) => serde_json::from_value(v).map_err(|e| Error::Persistence {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Lenient load for read-only paths: any failure is logged and the
    /// default document is returned.
    pub async fn load_or_default<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        match self.load(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "document load failed, using default");
                T::default()
            }
        }
    }

    pub async fn save<T: Serialize>(&self, key: &str, doc: &T) -> Result<()> {
        let _guard = self.locks.lock_key(key).await;
        self.save_unlocked(key, doc).await
    }

    /// Load, mutate and save `key` while holding its lock.
    ///
    /// An unreadable document aborts the update instead of being overwritten
    /// with a default.
    pub async fn update<T, R, F>(&self, key: &str, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self.locks.lock_key(key).await;
        let mut doc: T = self.load(key).await?;
        let out = f(&mut doc);
        self.save_unlocked(key, &doc).await?;
        Ok(out)
    }

    async fn save_unlocked<T: Serialize>(&self, key: &str, doc: &T) -> Result<()> {
        let value = serde_json::to_value(doc)?;
        self.store.save(key, &value).await
    }
}
