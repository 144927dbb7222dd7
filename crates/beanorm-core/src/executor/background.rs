//! Background continuation of large fetches.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::collection::BeanCollection;
use super::reader::BeanReader;
use crate::error::Error;

/// A unit of work handed to a [`BackgroundExecutor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs background fetch continuations.
pub trait BackgroundExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs each task on a new named thread.
#[derive(Debug, Default)]
pub struct ThreadExecutor;

impl BackgroundExecutor for ThreadExecutor {
    fn execute(&self, task: Task) {
        // The slot gives the task back if the thread cannot be spawned.
        let slot = Arc::new(Mutex::new(Some(task)));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("beanorm-fetch".to_string())
            .spawn(move || {
                if let Some(task) = worker_slot.lock().take() {
                    task();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn fetch thread, continuing inline");
            if let Some(task) = slot.lock().take() {
                task();
            }
        }
    }
}

/// Reads the remaining beans of a query into its collection.
pub(crate) struct BackgroundFetch {
    pub(crate) reader: BeanReader,
    pub(crate) collection: BeanCollection,
    /// Beans still allowed by max rows; `None` reads to the end.
    pub(crate) remaining: Option<usize>,
    pub(crate) started: Instant,
    /// Beans already read in the foreground.
    pub(crate) foreground_count: usize,
    pub(crate) collect_statistics: bool,
}

impl BackgroundFetch {
    fn read_rest(&mut self, count: &mut usize) -> Result<(), Error> {
        loop {
            if self.remaining.is_some_and(|r| *count >= r) {
                let more = self.reader.has_more()?;
                self.collection.set_has_more_rows(more);
                return Ok(());
            }
            match self.reader.next_bean()? {
                Some(bean) => {
                    self.collection.push(Arc::new(bean));
                    *count += 1;
                }
                None => return Ok(()),
            }
        }
    }

    pub(crate) fn run(mut self) {
        let plan = Arc::clone(self.reader.plan());
        debug!(plan_id = %plan.plan_id(), read = self.foreground_count, "Background fetch started");

        let mut count = 0usize;
        let result = self.read_rest(&mut count);

        if let Err(e) = result {
            error!(
                plan_id = %plan.plan_id(),
                sql = %plan.sql(),
                bind = %self.reader.bind_log(),
                error = %e,
                "Background fetch failed"
            );
            self.collection.set_error(e.to_string());
        }

        let total = self.foreground_count + count;
        if self.collect_statistics {
            plan.statistics().record(self.started.elapsed(), total as u64);
        }
        drop(self.reader);
        self.collection.mark_finished();
        debug!(plan_id = %plan.plan_id(), read = total, "Background fetch finished");
    }
}
