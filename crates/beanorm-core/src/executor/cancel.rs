//! Cooperative cancellation.
//!
//! One mutex guards the cancel flag together with the open statement and
//! result set. Prepare, bind, execute and every row read happen under it, so
//! a cancel either lands before execution starts or cancels the running
//! statement and stops the read loop at the next row.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::connection::{PreparedStatement, ResultSet};

#[derive(Default)]
pub(crate) struct ExecState {
    pub(crate) cancelled: bool,
    pub(crate) statement: Option<Box<dyn PreparedStatement>>,
    pub(crate) result_set: Option<Box<dyn ResultSet>>,
}

impl ExecState {
    /// Close the result set, then the statement. Safe to call repeatedly.
    pub(crate) fn close(&mut self) {
        if let Some(mut rs) = self.result_set.take() {
            rs.close();
        }
        if let Some(mut stmt) = self.statement.take() {
            stmt.close();
        }
    }
}

/// Handle for cancelling a query from another thread.
///
/// Cancellation is quiet: the query returns what it has read so far rather
/// than an error.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<Mutex<ExecState>>);

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancelHandle")
            .field(&self.is_cancelled())
            .finish()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the query, and its statement if one is executing.
    pub fn cancel(&self) {
        let mut state = self.0.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        let running = state.statement.is_some();
        if let Some(stmt) = state.statement.as_mut() {
            stmt.cancel();
        }
        debug!(running, "Query cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.lock().cancelled
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.0.lock()
    }

    /// Release the statement and result set.
    pub(crate) fn close(&self) {
        self.0.lock().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedStatement;

    #[test]
    fn test_cancel_before_execute() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.lock().statement.is_none());
    }

    #[test]
    fn test_cancel_reaches_statement_and_close_releases() {
        let handle = CancelHandle::new();
        let (stmt, state) = ScriptedStatement::new(Vec::new());
        handle.lock().statement = Some(Box::new(stmt));

        handle.cancel();
        assert!(state.cancelled());

        handle.close();
        assert!(state.closed());
        assert!(handle.lock().statement.is_none());
    }
}
