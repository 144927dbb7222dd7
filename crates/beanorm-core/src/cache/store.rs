//! Byte-level cache stores.
//!
//! Every cache region of every bean type is backed by one [`CacheStore`].
//! Stores hold opaque serialized keys and values; the coordinator owns the
//! encoding. A store may be remote or shared, so every call can fail.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

/// Cache store faults. The coordinator degrades these to misses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backing store cannot be reached.
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    /// A stored entry could not be decoded.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// A concurrent key/value store for one cache region.
pub trait CacheStore: fmt::Debug + Send + Sync {
    /// Get the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value, replacing any previous one.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CacheError>;

    /// Remove one entry.
    fn remove(&self, key: &[u8]) -> Result<(), CacheError>;

    /// Remove every entry.
    fn clear(&self) -> Result<(), CacheError>;

    /// Number of entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store over a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CacheError> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The independent caches kept per bean type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRegion {
    /// Bean snapshots by id.
    Bean,
    /// Natural key to id.
    NaturalKey,
    /// Ids of a to-many collection by owner id and property.
    ManyIds,
    /// Query results by query shape and bind values.
    Query,
}

impl CacheRegion {
    pub fn name(&self) -> &'static str {
        match self {
            CacheRegion::Bean => "bean",
            CacheRegion::NaturalKey => "natkey",
            CacheRegion::ManyIds => "many",
            CacheRegion::Query => "query",
        }
    }
}

/// Creates the store backing one region of one bean type.
pub trait CacheStoreFactory: fmt::Debug + Send + Sync {
    fn create(&self, bean_type: &str, region: CacheRegion) -> Arc<dyn CacheStore>;
}

/// Factory of [`MemoryStore`]s.
#[derive(Debug, Default)]
pub struct MemoryStoreFactory;

impl CacheStoreFactory for MemoryStoreFactory {
    fn create(&self, _bean_type: &str, _region: CacheRegion) -> Arc<dyn CacheStore> {
        Arc::new(MemoryStore::new())
    }
}
