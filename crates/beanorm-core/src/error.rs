//! Core error types.

use thiserror::Error;

use crate::connection::DbError;

/// Query engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] beanorm_proto::Error),

    /// No descriptor is registered for the bean type.
    #[error("unknown bean type '{0}'")]
    UnknownBean(String),

    /// A property or include path does not resolve against the mapping.
    #[error("unknown property '{path}' on bean '{bean}'")]
    UnknownProperty {
        /// Bean type the path was resolved from.
        bean: String,
        /// The offending path.
        path: String,
    },

    /// Mapping is inconsistent (missing join table, missing or ambiguous
    /// foreign key, join column mismatch).
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Query is structurally invalid.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A master id reappeared after the reader moved past it.
    #[error("master id {id} seen again after moving past it; ordering is not grouped by id: {sql}")]
    OrderingViolation {
        /// The reappearing master id.
        id: String,
        /// SQL that produced the rows.
        sql: String,
    },

    /// Raw database error before it is enriched at the executor boundary.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Statement execution or row reading failed.
    #[error("query execution failed: {source}; sql: {sql}; bind: {bind_log}")]
    Execution {
        /// Generated SQL.
        sql: String,
        /// Bind values in binding order.
        bind_log: String,
        /// Database or conversion error raised while executing.
        #[source]
        source: Box<Error>,
    },

    /// A unique find returned more than one bean.
    #[error("expected at most one {bean} but found {count}")]
    NonUniqueResult {
        /// Bean type queried.
        bean: String,
        /// Number of beans found.
        count: usize,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Cache store fault.
    #[error("cache error: {0}")]
    Cache(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether this error was caused by mapping or include configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::UnknownBean(_) | Error::UnknownProperty { .. } | Error::Mapping(_)
        )
    }

    /// Whether this error is a statement timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Execution { source, .. } => source.is_timeout(),
            Error::Database(DbError::Timeout) => true,
            _ => false,
        }
    }

    /// Attach SQL and bind values to an error raised while executing a
    /// statement or reading its rows.
    pub(crate) fn enrich(self, sql: &str, bind_log: &str) -> Self {
        match self {
            source @ (Error::Database(_)
            | Error::InvalidData(_)
            | Error::Deserialization(_)
            | Error::Protocol(_)) => Error::Execution {
                sql: sql.to_string(),
                bind_log: bind_log.to_string(),
                source: Box::new(source),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::UnknownBean("X".into()).is_config());
        assert!(Error::Mapping("no join table".into()).is_config());
        assert!(!Error::InvalidQuery("x".into()).is_config());

        let timeout = Error::Database(DbError::Timeout).enrich("select 1", "[]");
        assert!(timeout.is_timeout());
        assert!(matches!(timeout, Error::Execution { ref sql, .. } if sql == "select 1"));
        assert!(!Error::Database(DbError::Sql("boom".into())).is_timeout());
    }

    #[test]
    fn test_enrich_wraps_conversion_errors() {
        let err = Error::InvalidData("expected 0/1 but read 'x'".into()).enrich("select 1", "[7]");
        assert!(!err.is_timeout());
        assert!(matches!(
            err,
            Error::Execution { ref sql, ref bind_log, ref source }
                if sql == "select 1" && bind_log == "[7]" && matches!(**source, Error::InvalidData(_))
        ));
        assert!(err.to_string().contains("expected 0/1"));
    }

    #[test]
    fn test_enrich_keeps_other_errors() {
        let err = Error::Mapping("no join table".into()).enrich("select 1", "[]");
        assert!(err.is_config());

        let err = Error::OrderingViolation { id: "1".into(), sql: "select 1".into() }.enrich("select 1", "[]");
        assert!(matches!(err, Error::OrderingViolation { .. }));

        let twice = Error::Database(DbError::Timeout).enrich("select 1", "[]").enrich("select 2", "[]");
        assert!(matches!(twice, Error::Execution { ref sql, .. } if sql == "select 1"));
    }
}
