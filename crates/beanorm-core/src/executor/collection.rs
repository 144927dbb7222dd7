//! Query result collections.
//!
//! A collection is an append-only sequence written by one producer (the
//! foreground read loop, then possibly a background fetch) and read by any
//! number of threads. Readers that need the complete result wait for the
//! finished flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beanorm_proto::Value;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::bean::{Bean, BeanId};
use crate::descriptor::CollectionKind;

#[derive(Debug, Default)]
struct Contents {
    beans: Vec<Arc<Bean>>,
    ids: HashMap<BeanId, usize>,
    keys: HashMap<Value, usize>,
}

#[derive(Debug)]
struct Inner {
    kind: CollectionKind,
    contents: RwLock<Contents>,
    has_more_rows: AtomicBool,
    finished: Mutex<bool>,
    finished_cond: Condvar,
    error: Mutex<Option<String>>,
}

/// Beans returned by a find, possibly still being filled by a background
/// fetch. Clones share the same contents.
#[derive(Debug, Clone)]
pub struct BeanCollection {
    inner: Arc<Inner>,
}

impl BeanCollection {
    pub(crate) fn new(kind: CollectionKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                contents: RwLock::new(Contents::default()),
                has_more_rows: AtomicBool::new(false),
                finished: Mutex::new(false),
                finished_cond: Condvar::new(),
                error: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.inner.kind
    }

    /// Append a bean.
    pub(crate) fn push(&self, bean: Arc<Bean>) {
        let mut contents = self.inner.contents.write();
        match &self.inner.kind {
            CollectionKind::List => contents.beans.push(bean),
            CollectionKind::Set => {
                if let Some(id) = bean.id().cloned() {
                    if contents.ids.contains_key(&id) {
                        return;
                    }
                    let pos = contents.beans.len();
                    contents.ids.insert(id, pos);
                }
                contents.beans.push(bean);
            }
            CollectionKind::Map { key_property } => {
                let key = bean.scalar(key_property).cloned().unwrap_or(Value::Null);
                match contents.keys.get(&key).copied() {
                    Some(pos) => contents.beans[pos] = bean,
                    None => {
                        let pos = contents.beans.len();
                        contents.keys.insert(key, pos);
                        contents.beans.push(bean);
                    }
                }
            }
        }
    }

    pub(crate) fn set_has_more_rows(&self, more: bool) {
        self.inner.has_more_rows.store(more, Ordering::Release);
    }

    pub(crate) fn set_error(&self, error: String) {
        *self.inner.error.lock() = Some(error);
    }

    /// Mark the fetch complete and wake waiters.
    pub(crate) fn mark_finished(&self) {
        let mut finished = self.inner.finished.lock();
        *finished = true;
        self.inner.finished_cond.notify_all();
    }

    /// Number of beans read so far.
    pub fn len(&self) -> usize {
        self.inner.contents.read().beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<Bean>> {
        self.inner.contents.read().beans.get(index).cloned()
    }

    /// Copy of the beans read so far, in read order.
    pub fn beans(&self) -> Vec<Arc<Bean>> {
        self.inner.contents.read().beans.clone()
    }

    /// Look up a bean of a map result by its key value.
    pub fn get_by_key(&self, key: &Value) -> Option<Arc<Bean>> {
        let contents = self.inner.contents.read();
        contents.keys.get(key).map(|&pos| Arc::clone(&contents.beans[pos]))
    }

    /// Ids of the beans read so far.
    pub fn ids(&self) -> Vec<BeanId> {
        self.inner
            .contents
            .read()
            .beans
            .iter()
            .filter_map(|b| b.id().cloned())
            .collect()
    }

    /// More rows existed beyond the max rows limit.
    pub fn has_more_rows(&self) -> bool {
        self.inner.has_more_rows.load(Ordering::Acquire)
    }

    /// Whether fetching completed. Until then the collection may grow.
    pub fn is_finished(&self) -> bool {
        *self.inner.finished.lock()
    }

    /// Block until fetching completes.
    pub fn wait_finished(&self) {
        let mut finished = self.inner.finished.lock();
        while !*finished {
            self.inner.finished_cond.wait(&mut finished);
        }
    }

    /// Block until fetching completes or the timeout elapses. Returns
    /// whether fetching completed.
    pub fn wait_finished_timeout(&self, timeout: Duration) -> bool {
        let mut finished = self.inner.finished.lock();
        if !*finished {
            self.inner.finished_cond.wait_for(&mut finished, timeout);
        }
        *finished
    }

    /// Error that stopped a background fetch early, if any.
    pub fn background_error(&self) -> Option<String> {
        self.inner.error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: i64, name: &str) -> Arc<Bean> {
        Arc::new(Bean::loaded("Tag", BeanId::single(id)).with_scalar("name", name))
    }

    #[test]
    fn test_set_dedups_by_id() {
        let set = BeanCollection::new(CollectionKind::Set);
        set.push(tag(1, "a"));
        set.push(tag(1, "a"));
        set.push(tag(2, "b"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.ids(), vec![BeanId::single(1i64), BeanId::single(2i64)]);
    }

    #[test]
    fn test_map_replaces_by_key() {
        let map = BeanCollection::new(CollectionKind::Map {
            key_property: "name".into(),
        });
        map.push(tag(1, "a"));
        map.push(tag(2, "a"));
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get_by_key(&Value::from("a")).and_then(|b| b.id().cloned()),
            Some(BeanId::single(2i64))
        );
    }

    #[test]
    fn test_wait_finished_across_threads() {
        let list = BeanCollection::new(CollectionKind::List);
        assert!(!list.wait_finished_timeout(Duration::from_millis(1)));

        let producer = list.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                producer.push(tag(i, "x"));
            }
            producer.mark_finished();
        });
        list.wait_finished();
        assert_eq!(list.len(), 100);
        assert!(list.is_finished());
        handle.join().unwrap();
    }
}
