//! Table change listeners.

use std::sync::Arc;

use beanorm_proto::TableChange;
use parking_lot::RwLock;

/// Observes table changes after the caches have been invalidated.
pub trait TableChangeListener: Send + Sync {
    fn on_change(&self, change: &TableChange);
}

/// An ordered, copy-on-write list of handlers.
///
/// Registration swaps in a new list, so a notification in flight keeps
/// iterating the snapshot it started with and never sees a half-applied
/// change.
pub struct ListenerChain<L: ?Sized> {
    handlers: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for ListenerChain<L> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerChain<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerChain")
            .field("len", &self.len())
            .finish()
    }
}

impl<L: ?Sized> ListenerChain<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler.
    pub fn add(&self, handler: Arc<L>) {
        let mut handlers = self.handlers.write();
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push(handler);
        *handlers = Arc::new(next);
    }

    /// Remove a handler by identity. Returns whether it was registered.
    pub fn remove(&self, handler: &Arc<L>) -> bool {
        let mut handlers = self.handlers.write();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, handler)) {
            return false;
        }
        let next: Vec<Arc<L>> = handlers
            .iter()
            .filter(|h| !Arc::ptr_eq(h, handler))
            .cloned()
            .collect();
        *handlers = Arc::new(next);
        true
    }

    /// Current handlers in registration order.
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.handlers.read())
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ListenerChain<dyn TableChangeListener> {
    /// Notify every handler in registration order. No lock is held while
    /// handlers run.
    pub fn notify(&self, change: &TableChange) {
        let handlers = self.snapshot();
        for handler in handlers.iter() {
            handler.on_change(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TableChangeListener for Recorder {
        fn on_change(&self, change: &TableChange) {
            self.log.lock().push(format!("{}:{}", self.name, change.table));
        }
    }

    #[test]
    fn test_registration_order_and_remove() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: ListenerChain<dyn TableChangeListener> = ListenerChain::new();
        let first: Arc<dyn TableChangeListener> = Arc::new(Recorder { name: "a", log: log.clone() });
        let second: Arc<dyn TableChangeListener> = Arc::new(Recorder { name: "b", log: log.clone() });
        chain.add(first.clone());
        chain.add(second.clone());

        chain.notify(&TableChange::insert("o_order"));
        assert_eq!(*log.lock(), vec!["a:o_order", "b:o_order"]);

        assert!(chain.remove(&first));
        assert!(!chain.remove(&first));
        chain.notify(&TableChange::delete("o_tag"));
        assert_eq!(log.lock().last().map(String::as_str), Some("b:o_tag"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_registration() {
        let chain: ListenerChain<dyn TableChangeListener> = ListenerChain::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        chain.add(Arc::new(Recorder { name: "a", log: log.clone() }));
        let before = chain.snapshot();
        chain.add(Arc::new(Recorder { name: "b", log }));
        assert_eq!(before.len(), 1);
        assert_eq!(chain.snapshot().len(), 2);
    }
}
