//! Second-level cache: bean snapshots, natural keys, collection ids and
//! query results shared across transactions.

mod coordinator;
mod data;
mod listener;
mod store;

pub use coordinator::CacheCoordinator;
pub use data::{
    encode_key, many_ids_key, query_key, CachedBeanData, CachedField, CachedManyIds, CachedProperty,
    CachedQueryResult, CachedValue,
};
pub use listener::{ListenerChain, TableChangeListener};
pub use store::{CacheError, CacheRegion, CacheStore, CacheStoreFactory, MemoryStore, MemoryStoreFactory};
