//! Table modification events used for cache invalidation.

use serde::{Deserialize, Serialize};

/// Describes DML performed against one table.
///
/// Raised after persisting through the engine and by callers that modify
/// tables directly with SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    /// Table name (case insensitive).
    pub table: String,
    /// Rows were inserted.
    pub inserted: bool,
    /// Rows were updated.
    pub updated: bool,
    /// Rows were deleted.
    pub deleted: bool,
}

impl TableChange {
    /// Create an event with explicit flags.
    pub fn new(table: impl Into<String>, inserted: bool, updated: bool, deleted: bool) -> Self {
        Self {
            table: table.into(),
            inserted,
            updated,
            deleted,
        }
    }

    /// Insert-only event.
    pub fn insert(table: impl Into<String>) -> Self {
        Self::new(table, true, false, false)
    }

    /// Update-only event.
    pub fn update(table: impl Into<String>) -> Self {
        Self::new(table, false, true, false)
    }

    /// Delete-only event.
    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, false, false, true)
    }

    /// Whether existing rows may have changed.
    pub fn modifies_existing(&self) -> bool {
        self.updated || self.deleted
    }
}
