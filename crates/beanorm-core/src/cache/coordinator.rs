//! Second-level cache coordinator.
//!
//! Each root bean type gets four independent stores (bean by id, natural key
//! to id, to-many ids and query results) created on first use. Every store
//! call is best effort: a fault is logged and treated as a miss or a skipped
//! write, so reads always fall through to the database. A region whose clear
//! or write failed may still hold outdated entries, so it is bypassed until
//! a later clear succeeds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use beanorm_proto::{TableChange, Value};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::data::{encode_key, many_ids_key, CachedBeanData, CachedManyIds, CachedQueryResult};
use super::store::{CacheError, CacheRegion, CacheStore, CacheStoreFactory, MemoryStoreFactory};
use crate::bean::{Bean, BeanId};
use crate::descriptor::{BeanDescriptor, DescriptorRegistry};
use crate::error::Error;
use crate::plan::CacheStats;

/// Stores of one root bean type.
#[derive(Debug)]
struct BeanTypeCache {
    beans: Arc<dyn CacheStore>,
    natural_keys: Arc<dyn CacheStore>,
    many_ids: Arc<dyn CacheStore>,
    queries: Arc<dyn CacheStore>,
    /// Instances handed out for sharable types, by encoded id.
    shared: DashMap<Vec<u8>, Arc<Bean>>,
    /// Bumped after every bean write, so a reader that loaded an older
    /// snapshot does not publish it as the shared instance.
    generation: AtomicU64,
    /// Tables read by any cached query result of this type.
    query_tables: Mutex<BTreeSet<String>>,
    beans_stale: AtomicBool,
    many_ids_stale: AtomicBool,
    queries_stale: AtomicBool,
    /// Serializes region clears with their stale flag updates.
    clear_lock: Mutex<()>,
}

impl BeanTypeCache {
    fn new(factory: &dyn CacheStoreFactory, bean_type: &str) -> Self {
        Self {
            beans: factory.create(bean_type, CacheRegion::Bean),
            natural_keys: factory.create(bean_type, CacheRegion::NaturalKey),
            many_ids: factory.create(bean_type, CacheRegion::ManyIds),
            queries: factory.create(bean_type, CacheRegion::Query),
            shared: DashMap::new(),
            generation: AtomicU64::new(0),
            query_tables: Mutex::new(BTreeSet::new()),
            beans_stale: AtomicBool::new(false),
            many_ids_stale: AtomicBool::new(false),
            queries_stale: AtomicBool::new(false),
            clear_lock: Mutex::new(()),
        }
    }

    /// The natural key index lives and dies with the bean region.
    fn stale_flag(&self, region: CacheRegion) -> &AtomicBool {
        match region {
            CacheRegion::Bean | CacheRegion::NaturalKey => &self.beans_stale,
            CacheRegion::ManyIds => &self.many_ids_stale,
            CacheRegion::Query => &self.queries_stale,
        }
    }

    fn drop_shared(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.clear();
    }

    /// Clear a region. Returns false, leaving the region bypassed, when any
    /// of its stores could not be cleared.
    fn clear(&self, bean_type: &str, region: CacheRegion) -> bool {
        let _guard = self.clear_lock.lock();
        let cleared = match region {
            CacheRegion::Bean | CacheRegion::NaturalKey => {
                let beans = degrade(self.beans.clear(), bean_type, CacheRegion::Bean).is_some();
                let keys = degrade(self.natural_keys.clear(), bean_type, CacheRegion::NaturalKey).is_some();
                self.drop_shared();
                beans && keys
            }
            CacheRegion::ManyIds => degrade(self.many_ids.clear(), bean_type, region).is_some(),
            CacheRegion::Query => {
                let cleared = degrade(self.queries.clear(), bean_type, region).is_some();
                self.query_tables.lock().clear();
                cleared
            }
        };
        let was_stale = self.stale_flag(region).swap(!cleared, Ordering::SeqCst);
        if !cleared {
            warn!(bean = bean_type, region = region.name(), "Cache region bypassed until it can be cleared");
        } else if was_stale {
            debug!(bean = bean_type, region = region.name(), "Cache region cleared and re-enabled");
        }
        cleared
    }

    /// Bypass a region after a write that may have left an outdated entry.
    fn mark_stale(&self, bean_type: &str, region: CacheRegion) {
        let _guard = self.clear_lock.lock();
        self.stale_flag(region).store(true, Ordering::SeqCst);
        if matches!(region, CacheRegion::Bean | CacheRegion::NaturalKey) {
            self.drop_shared();
        }
        warn!(bean = bean_type, region = region.name(), "Cache region bypassed after a failed write");
    }

    /// Whether a region may be used, clearing a bypassed one first.
    fn usable(&self, bean_type: &str, region: CacheRegion) -> bool {
        !self.stale_flag(region).load(Ordering::SeqCst) || self.clear(bean_type, region)
    }
}

/// Log a store fault and turn it into a miss.
fn degrade<T>(result: Result<T, CacheError>, bean_type: &str, region: CacheRegion) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(bean = bean_type, region = region.name(), error = %e, "Cache fault treated as miss");
            None
        }
    }
}

fn degrade_codec<T>(result: Result<T, Error>, bean_type: &str, region: CacheRegion) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(bean = bean_type, region = region.name(), error = %e, "Cache entry codec failed");
            None
        }
    }
}

fn encode_id(id: &BeanId) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(&id.0)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_id(bytes: &[u8]) -> Result<BeanId, Error> {
    rkyv::from_bytes::<Vec<Value>, rkyv::rancor::Error>(bytes)
        .map(BeanId)
        .map_err(|e| Error::Deserialization(e.to_string()))
}

/// Coordinates the second-level caches of all bean types.
#[derive(Debug)]
pub struct CacheCoordinator {
    registry: Arc<DescriptorRegistry>,
    factory: Arc<dyn CacheStoreFactory>,
    types: DashMap<String, Arc<BeanTypeCache>>,
    stats: CacheStats,
}

impl CacheCoordinator {
    /// Create a coordinator with in-memory stores.
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self::with_factory(registry, Arc::new(MemoryStoreFactory))
    }

    /// Create a coordinator whose stores come from `factory`.
    pub fn with_factory(registry: Arc<DescriptorRegistry>, factory: Arc<dyn CacheStoreFactory>) -> Self {
        Self {
            registry,
            factory,
            types: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Bean cache hit and miss counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn type_cache(&self, bean_type: &str) -> Arc<BeanTypeCache> {
        if let Some(cache) = self.types.get(bean_type) {
            return Arc::clone(cache.value());
        }
        let cache = self
            .types
            .entry(bean_type.to_string())
            .or_insert_with(|| Arc::new(BeanTypeCache::new(self.factory.as_ref(), bean_type)));
        Arc::clone(cache.value())
    }

    fn existing(&self, bean_type: &str) -> Option<Arc<BeanTypeCache>> {
        self.types.get(bean_type).map(|c| Arc::clone(c.value()))
    }

    fn load_snapshot(&self, cache: &BeanTypeCache, bean_type: &str, key: &[u8]) -> Option<CachedBeanData> {
        let bytes = degrade(cache.beans.get(key), bean_type, CacheRegion::Bean)??;
        let data = degrade_codec(CachedBeanData::from_bytes(&bytes), bean_type, CacheRegion::Bean);
        if data.is_none() {
            let _ = cache.beans.remove(key);
        }
        data
    }

    /// Get a cached bean by id.
    ///
    /// For sharable types, unless `mutable` is set, every caller gets the
    /// same instance and must not mutate it. Otherwise each call rebuilds a
    /// fresh instance.
    pub fn get(&self, desc: &BeanDescriptor, id: &BeanId, mutable: bool) -> Option<Arc<Bean>> {
        if !desc.cache_options().bean_cache {
            return None;
        }
        let cache = self.type_cache(desc.name());
        if !cache.usable(desc.name(), CacheRegion::Bean) {
            self.stats.record_miss();
            return None;
        }
        let key = encode_key(id.values());
        let share = desc.is_sharable() && !mutable;

        if share {
            if let Some(bean) = cache.shared.get(&key) {
                self.stats.record_hit();
                return Some(Arc::clone(bean.value()));
            }
        }

        let generation = cache.generation.load(Ordering::SeqCst);
        let Some(data) = self.load_snapshot(&cache, desc.name(), &key) else {
            self.stats.record_miss();
            return None;
        };
        self.stats.record_hit();
        let bean = Arc::new(data.to_bean(desc));
        if !share {
            return Some(bean);
        }
        // Writers bump the generation before dropping shared instances, so
        // the check under the entry lock sees any write since the load.
        let result = match cache.shared.entry(key) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                if cache.generation.load(Ordering::SeqCst) == generation {
                    entry.insert(Arc::clone(&bean));
                }
                Some(bean)
            }
        };
        result
    }

    /// Get a cached bean through the natural key index.
    pub fn get_by_natural_key(&self, desc: &BeanDescriptor, value: &Value, mutable: bool) -> Option<Arc<Bean>> {
        desc.cache_options().natural_key.as_ref()?;
        if !desc.cache_options().bean_cache {
            return None;
        }
        let cache = self.type_cache(desc.name());
        if !cache.usable(desc.name(), CacheRegion::NaturalKey) {
            return None;
        }
        let bytes = degrade(
            cache.natural_keys.get(&encode_key(std::slice::from_ref(value))),
            desc.name(),
            CacheRegion::NaturalKey,
        )??;
        let id = degrade_codec(decode_id(&bytes), desc.name(), CacheRegion::NaturalKey)?;
        self.get(desc, &id, mutable)
    }

    /// Store a snapshot of a loaded bean.
    pub fn put(&self, desc: &BeanDescriptor, bean: &Bean) {
        if !desc.cache_options().bean_cache {
            return;
        }
        let Some(data) = degrade_codec(CachedBeanData::from_bean(desc, bean), desc.name(), CacheRegion::Bean) else {
            return;
        };
        let cache = self.type_cache(desc.name());
        if cache.usable(desc.name(), CacheRegion::Bean) {
            self.store_snapshot(&cache, desc, data);
        }
    }

    /// Merge the changed properties of `bean` into its cached snapshot.
    ///
    /// Called after a persist. Without a prior snapshot the changes become
    /// the snapshot.
    pub fn cache_update(&self, desc: &BeanDescriptor, bean: &Bean) {
        if !desc.cache_options().bean_cache {
            return;
        }
        let Some(changes) = degrade_codec(CachedBeanData::from_bean(desc, bean), desc.name(), CacheRegion::Bean)
        else {
            return;
        };
        let cache = self.type_cache(desc.name());
        if !cache.usable(desc.name(), CacheRegion::Bean) {
            return;
        }
        let key = encode_key(&changes.id);
        let merged = match self.load_snapshot(&cache, desc.name(), &key) {
            Some(prior) => prior.merge(desc, &changes),
            None => changes,
        };
        self.store_snapshot(&cache, desc, merged);
    }

    fn store_snapshot(&self, cache: &BeanTypeCache, desc: &BeanDescriptor, data: CachedBeanData) {
        let key = encode_key(&data.id);

        if desc.cache_options().natural_key.is_some() {
            let prior_key = self
                .load_snapshot(cache, desc.name(), &key)
                .and_then(|prior| prior.natural_key);
            if let Some(old) = prior_key.filter(|old| data.natural_key.as_ref() != Some(old)) {
                let removed = degrade(
                    cache.natural_keys.remove(&encode_key(std::slice::from_ref(&old))),
                    desc.name(),
                    CacheRegion::NaturalKey,
                );
                if removed.is_none() {
                    cache.mark_stale(desc.name(), CacheRegion::NaturalKey);
                    return;
                }
            }
            let id = BeanId(data.id.clone());
            if let (Some(new), Some(id)) = (
                &data.natural_key,
                degrade_codec(encode_id(&id), desc.name(), CacheRegion::NaturalKey),
            ) {
                let _ = degrade(
                    cache.natural_keys.put(encode_key(std::slice::from_ref(new)), id),
                    desc.name(),
                    CacheRegion::NaturalKey,
                );
            }
        }

        let Some(bytes) = degrade_codec(data.to_bytes(), desc.name(), CacheRegion::Bean) else {
            return;
        };
        // A failed put may leave the prior snapshot behind.
        if degrade(cache.beans.put(key.clone(), bytes), desc.name(), CacheRegion::Bean).is_none() {
            cache.mark_stale(desc.name(), CacheRegion::Bean);
            return;
        }
        cache.generation.fetch_add(1, Ordering::SeqCst);
        cache.shared.remove(&key);
    }

    /// Remove one bean, its natural key mapping and any shared instance.
    pub fn remove(&self, desc: &BeanDescriptor, id: &BeanId) {
        let Some(cache) = self.existing(desc.name()) else {
            return;
        };
        if !cache.usable(desc.name(), CacheRegion::Bean) {
            return;
        }
        let key = encode_key(id.values());
        let mut removed = true;
        if let Some(nk) = self.load_snapshot(&cache, desc.name(), &key).and_then(|d| d.natural_key) {
            removed &= degrade(
                cache.natural_keys.remove(&encode_key(std::slice::from_ref(&nk))),
                desc.name(),
                CacheRegion::NaturalKey,
            )
            .is_some();
        }
        removed &= degrade(cache.beans.remove(&key), desc.name(), CacheRegion::Bean).is_some();
        if !removed {
            cache.mark_stale(desc.name(), CacheRegion::Bean);
            return;
        }
        cache.generation.fetch_add(1, Ordering::SeqCst);
        cache.shared.remove(&key);
    }

    /// Cache the ids of a loaded to-many collection.
    pub fn put_many_ids(&self, desc: &BeanDescriptor, owner: &BeanId, property: &str, ids: &[BeanId]) {
        if !desc.cache_options().bean_cache {
            return;
        }
        let cache = self.type_cache(desc.name());
        if !cache.usable(desc.name(), CacheRegion::ManyIds) {
            return;
        }
        if let Some(bytes) = degrade_codec(CachedManyIds::new(ids).to_bytes(), desc.name(), CacheRegion::ManyIds) {
            let stored = degrade(
                cache.many_ids.put(many_ids_key(owner, property), bytes),
                desc.name(),
                CacheRegion::ManyIds,
            );
            if stored.is_none() {
                cache.mark_stale(desc.name(), CacheRegion::ManyIds);
            }
        }
    }

    /// Cached ids of a to-many collection.
    pub fn get_many_ids(&self, desc: &BeanDescriptor, owner: &BeanId, property: &str) -> Option<Vec<BeanId>> {
        let cache = self.existing(desc.name())?;
        if !cache.usable(desc.name(), CacheRegion::ManyIds) {
            return None;
        }
        let bytes = degrade(
            cache.many_ids.get(&many_ids_key(owner, property)),
            desc.name(),
            CacheRegion::ManyIds,
        )??;
        degrade_codec(CachedManyIds::from_bytes(&bytes), desc.name(), CacheRegion::ManyIds).map(|m| m.bean_ids())
    }

    /// Cache a query result. `tables` are the tables the query read; a change
    /// to any of them clears this type's query cache.
    pub fn put_query(&self, desc: &BeanDescriptor, key: Vec<u8>, result: &CachedQueryResult, tables: &BTreeSet<String>) {
        let cache = self.type_cache(desc.name());
        if !cache.usable(desc.name(), CacheRegion::Query) {
            return;
        }
        let Some(bytes) = degrade_codec(result.to_bytes(), desc.name(), CacheRegion::Query) else {
            return;
        };
        cache.query_tables.lock().extend(tables.iter().cloned());
        if degrade(cache.queries.put(key, bytes), desc.name(), CacheRegion::Query).is_none() {
            cache.mark_stale(desc.name(), CacheRegion::Query);
        }
    }

    /// Cached query result.
    pub fn get_query(&self, desc: &BeanDescriptor, key: &[u8]) -> Option<CachedQueryResult> {
        let cache = self.existing(desc.name())?;
        if !cache.usable(desc.name(), CacheRegion::Query) {
            return None;
        }
        let bytes = degrade(cache.queries.get(key), desc.name(), CacheRegion::Query)??;
        degrade_codec(CachedQueryResult::from_bytes(&bytes), desc.name(), CacheRegion::Query)
    }

    /// Apply a table change to the caches.
    ///
    /// Bean types stored in the table lose their query results, and on
    /// update or delete also their beans. Types with collections of those
    /// beans, or with a many-to-many through the table, lose their cached
    /// collection ids. Any other type whose cached queries read the table
    /// loses its query results.
    pub fn invalidate(&self, change: &TableChange) {
        let table = change.table.to_ascii_lowercase();
        let stored = self.registry.beans_for_table(&table);

        for bean_type in stored {
            if let Some(cache) = self.existing(bean_type) {
                cache.clear(bean_type, CacheRegion::Query);
                if change.modifies_existing() {
                    cache.clear(bean_type, CacheRegion::Bean);
                    cache.clear(bean_type, CacheRegion::ManyIds);
                }
            }
        }

        let link_owners = self.registry.intersection_owners(&table);
        for desc in self.registry.iter() {
            let owns_collection = desc.manys().any(|(_, many)| {
                self.registry
                    .find(&many.target)
                    .is_some_and(|target| stored.iter().any(|t| t == target.name()))
            });
            if owns_collection || link_owners.iter().any(|o| o == desc.name()) {
                if let Some(cache) = self.existing(desc.name()) {
                    cache.clear(desc.name(), CacheRegion::ManyIds);
                }
            }
        }

        for entry in self.types.iter() {
            if entry.value().query_tables.lock().contains(&table) {
                entry.value().clear(entry.key(), CacheRegion::Query);
            }
        }

        debug!(
            table = %table,
            inserted = change.inserted,
            updated = change.updated,
            deleted = change.deleted,
            beans = stored.len(),
            "Cache invalidated for table change"
        );
    }

    /// Clear every cache of every bean type.
    pub fn clear_all(&self) {
        for entry in self.types.iter() {
            for region in [CacheRegion::Bean, CacheRegion::ManyIds, CacheRegion::Query] {
                entry.value().clear(entry.key(), region);
            }
        }
    }
}
