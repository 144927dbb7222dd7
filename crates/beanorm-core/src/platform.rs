//! Database platform strategies.
//!
//! Only the parts of SQL that differ between databases and matter to the
//! engine live here: row limiting and decryption of encrypted columns.

use std::fmt;

/// SQL after row limits were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitedSql {
    pub sql: String,
    /// The statement was wrapped to number rows.
    pub uses_row_number: bool,
}

/// Dialect specific SQL generation.
pub trait DatabasePlatform: fmt::Debug + Send + Sync {
    /// Platform name for logging.
    fn name(&self) -> &str;

    /// Apply `first_row` / `max_rows` to a complete select statement.
    ///
    /// One row past `max_rows` is requested so the reader can tell whether
    /// more rows exist.
    fn apply_limit(&self, sql: String, first_row: usize, max_rows: Option<usize>) -> LimitedSql;

    /// Whether selected columns need unique aliases for the limit wrapping.
    fn requires_column_alias(&self) -> bool {
        false
    }

    /// Expression selecting the decrypted value of an encrypted column.
    fn decrypt_expression(&self, column: &str) -> String {
        format!("decrypt({column})")
    }
}

/// `LIMIT` / `OFFSET` clause platforms (Postgres, MySQL, SQLite, H2).
#[derive(Debug, Default)]
pub struct LimitOffsetPlatform;

impl DatabasePlatform for LimitOffsetPlatform {
    fn name(&self) -> &str {
        "limit-offset"
    }

    fn apply_limit(&self, mut sql: String, first_row: usize, max_rows: Option<usize>) -> LimitedSql {
        if let Some(max) = max_rows {
            sql.push_str(&format!(" limit {}", max + 1));
        }
        if first_row > 0 {
            sql.push_str(&format!(" offset {first_row}"));
        }
        LimitedSql {
            sql,
            uses_row_number: false,
        }
    }
}

/// Platforms without a limit clause: the statement is wrapped and filtered
/// on a row number column appended after the selected columns, so column
/// positions of the inner select are unchanged.
#[derive(Debug, Default)]
pub struct RowNumberPlatform;

impl DatabasePlatform for RowNumberPlatform {
    fn name(&self) -> &str {
        "row-number"
    }

    fn apply_limit(&self, sql: String, first_row: usize, max_rows: Option<usize>) -> LimitedSql {
        if first_row == 0 && max_rows.is_none() {
            return LimitedSql {
                sql,
                uses_row_number: false,
            };
        }
        let mut filter = format!("rn_ > {first_row}");
        if let Some(max) = max_rows {
            filter.push_str(&format!(" and rn_ <= {}", first_row + max + 1));
        }
        LimitedSql {
            sql: format!(
                "select * from (select r_.*, row_number() over () rn_ from ({sql}) r_) q_ where {filter} order by rn_"
            ),
            uses_row_number: true,
        }
    }

    fn requires_column_alias(&self) -> bool {
        true
    }

    fn decrypt_expression(&self, column: &str) -> String {
        format!("decrypt_aes({column})")
    }
}
