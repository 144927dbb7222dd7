//! Database connection boundary.
//!
//! The engine never manages connections itself. Callers hand it a live
//! [`Connection`] for the duration of one query; statements and result sets
//! created from it are owned by the executor and always closed on exit.
//!
//! Column and bind positions are zero-based.

use std::time::Duration;

use beanorm_proto::Value;
use thiserror::Error;

/// Errors raised by the database driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The statement exceeded its query timeout.
    #[error("statement timed out")]
    Timeout,

    /// The statement was cancelled.
    #[error("statement cancelled")]
    Cancelled,

    /// The statement or result set was already closed.
    #[error("statement or result set closed")]
    Closed,

    /// Any other SQL failure.
    #[error("sql error: {0}")]
    Sql(String),
}

/// A live database connection owned by one thread for one query.
pub trait Connection: Send {
    /// Prepare a statement.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError>;

    /// Flush writes queued in the current transaction batch.
    ///
    /// Called before every read so the query observes them.
    fn batch_flush(&mut self) -> Result<(), DbError>;
}

/// A prepared statement.
pub trait PreparedStatement: Send {
    /// Bind a value at a zero-based position.
    fn bind(&mut self, position: usize, value: &Value) -> Result<(), DbError>;

    /// Set the query timeout enforced by the driver.
    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DbError>;

    /// Execute and open a result set.
    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>, DbError>;

    /// Cancel a running execution.
    fn cancel(&mut self);

    /// Release the statement.
    fn close(&mut self);
}

/// Forward-only cursor over result rows.
pub trait ResultSet: Send {
    /// Advance to the next row. Returns false when exhausted.
    fn next(&mut self) -> Result<bool, DbError>;

    /// Read a column of the current row by zero-based index.
    fn get(&self, index: usize) -> Result<Value, DbError>;

    /// Release the result set.
    fn close(&mut self);
}
