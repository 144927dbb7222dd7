//! Bean query IR.
//!
//! A [`BeanQuery`] describes what to load: the root bean type, which
//! associations to join-fetch, predicates, ordering and row limits. It holds
//! logical property paths only; the engine maps them to tables and columns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::expr::Expr;
use crate::value::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// One order-by entry on a property path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Property path to order by.
    pub path: String,
    /// Sort direction.
    pub direction: OrderDirection,
}

impl OrderSpec {
    /// Create ascending order.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create descending order.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Whether this entry orders by `path` or by a property beneath it.
    pub fn references(&self, path: &str) -> bool {
        self.path == path
            || (self.path.len() > path.len()
                && self.path.starts_with(path)
                && self.path.as_bytes()[path.len()] == b'.')
    }
}

/// An association to join-fetch, with an optional partial property list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPath {
    /// Dot separated association path (e.g. `customer` or `details.product`).
    pub path: String,
    /// Properties to select on the fetched bean (empty = default set).
    pub properties: Vec<String>,
}

impl FetchPath {
    /// Fetch all default properties of the association.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            properties: Vec::new(),
        }
    }

    /// Fetch only the listed properties.
    pub fn partial(path: impl Into<String>, properties: &[&str]) -> Self {
        Self {
            path: path.into(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// A raw SQL clause with named (`:name`) and positional (`?`) parameters.
///
/// Identifiers in the text that name bean properties are translated to
/// columns by the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawClause {
    /// Clause text.
    pub sql: String,
    /// Named parameter values.
    pub named: BTreeMap<String, Value>,
    /// Positional parameter values in order of appearance.
    pub positional: Vec<Value>,
}

impl RawClause {
    /// Create a clause without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// Second-level cache participation for one query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheUse {
    /// Use the bean cache. `None` defers to the bean type's cache options.
    pub bean_cache: Option<bool>,
    /// Use the query-result cache.
    pub query_cache: bool,
    /// Return instances the caller may mutate, never shared cache instances.
    pub mutable: bool,
}

/// A query for beans of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeanQuery {
    /// Root bean type name.
    pub bean_type: String,
    /// Partial property list for the root bean (empty = default set).
    pub select: Vec<String>,
    /// Associations to join-fetch.
    pub fetches: Vec<FetchPath>,
    /// Identity value for find-by-id.
    pub id: Option<Vec<Value>>,
    /// Raw where clause.
    pub where_raw: Option<RawClause>,
    /// Where expression tree.
    pub where_expr: Option<Expr>,
    /// Raw having clause.
    pub having_raw: Option<RawClause>,
    /// Having expression tree.
    pub having_expr: Option<Expr>,
    /// Ordering specification.
    pub order_by: Vec<OrderSpec>,
    /// Force SQL `distinct`.
    pub distinct: bool,
    /// Caller supplied `select .. from ..` prefix whose columns follow the
    /// default property order of the root bean.
    pub raw_sql: Option<String>,
    /// Number of leading beans to skip.
    pub first_row: usize,
    /// Maximum number of beans to return.
    pub max_rows: Option<usize>,
    /// Continue fetching in the background after this many beans.
    pub background_fetch_after: Option<usize>,
    /// Cache participation.
    pub cache: CacheUse,
}

impl BeanQuery {
    /// Create a query for a bean type.
    pub fn new(bean_type: impl Into<String>) -> Self {
        Self {
            bean_type: bean_type.into(),
            select: Vec::new(),
            fetches: Vec::new(),
            id: None,
            where_raw: None,
            where_expr: None,
            having_raw: None,
            having_expr: None,
            order_by: Vec::new(),
            distinct: false,
            raw_sql: None,
            first_row: 0,
            max_rows: None,
            background_fetch_after: None,
            cache: CacheUse::default(),
        }
    }

    /// Select only these root properties.
    pub fn select(mut self, properties: &[&str]) -> Self {
        self.select = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Join-fetch an association with its default properties.
    pub fn fetch(mut self, path: impl Into<String>) -> Self {
        self.fetches.push(FetchPath::new(path));
        self
    }

    /// Join-fetch an association selecting only the listed properties.
    pub fn fetch_partial(mut self, path: impl Into<String>, properties: &[&str]) -> Self {
        self.fetches.push(FetchPath::partial(path, properties));
        self
    }

    /// Restrict to a single identity value.
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(vec![id.into()]);
        self
    }

    /// Restrict to a compound identity value.
    pub fn with_compound_id(mut self, id: Vec<Value>) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the raw where clause.
    pub fn where_raw(mut self, sql: impl Into<String>) -> Self {
        self.where_raw = Some(RawClause::new(sql));
        self
    }

    /// Set a named parameter on the raw where clause.
    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_raw
            .get_or_insert_with(RawClause::default)
            .named
            .insert(name.into(), value.into());
        self
    }

    /// Append a positional parameter to the raw where clause.
    pub fn add_parameter(mut self, value: impl Into<Value>) -> Self {
        self.where_raw
            .get_or_insert_with(RawClause::default)
            .positional
            .push(value.into());
        self
    }

    /// Add a where expression, and-ing with any existing one.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_expr = Some(match self.where_expr.take() {
            None => expr,
            Some(Expr::And(mut exprs)) => {
                exprs.push(expr);
                Expr::And(exprs)
            }
            Some(existing) => Expr::And(vec![existing, expr]),
        });
        self
    }

    /// Set the raw having clause.
    pub fn having_raw(mut self, clause: RawClause) -> Self {
        self.having_raw = Some(clause);
        self
    }

    /// Set the having expression.
    pub fn having(mut self, expr: Expr) -> Self {
        self.having_expr = Some(expr);
        self
    }

    /// Append an order-by entry.
    pub fn order_by(mut self, order: OrderSpec) -> Self {
        self.order_by.push(order);
        self
    }

    /// Force SQL distinct.
    pub fn set_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Use a caller supplied select/from prefix.
    pub fn with_raw_sql(mut self, sql: impl Into<String>) -> Self {
        self.raw_sql = Some(sql.into());
        self
    }

    /// Skip leading beans.
    pub fn first_row(mut self, first_row: usize) -> Self {
        self.first_row = first_row;
        self
    }

    /// Limit the number of beans returned.
    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Continue fetching in the background after `after` beans.
    pub fn background_fetch_after(mut self, after: usize) -> Self {
        self.background_fetch_after = Some(after);
        self
    }

    /// Set cache participation.
    pub fn with_cache(mut self, cache: CacheUse) -> Self {
        self.cache = cache;
        self
    }

    /// Use the query-result cache.
    pub fn use_query_cache(mut self, use_cache: bool) -> Self {
        self.cache.query_cache = use_cache;
        self
    }

    /// Override the bean cache default.
    pub fn use_bean_cache(mut self, use_cache: bool) -> Self {
        self.cache.bean_cache = Some(use_cache);
        self
    }

    /// Ask for mutable instances rather than shared cached ones.
    pub fn mutable(mut self) -> Self {
        self.cache.mutable = true;
        self
    }

    /// Whether any predicate is present.
    pub fn has_predicates(&self) -> bool {
        self.where_raw.is_some()
            || self.where_expr.is_some()
            || self.having_raw.is_some()
            || self.having_expr.is_some()
    }

    /// Check structural validity before planning.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bean_type.is_empty() {
            return Err(Error::InvalidQuery("bean type is empty".to_string()));
        }
        for fetch in &self.fetches {
            if fetch.path.is_empty() || fetch.path.split('.').any(str::is_empty) {
                return Err(Error::InvalidQuery(format!(
                    "invalid fetch path '{}'",
                    fetch.path
                )));
            }
        }
        if self.max_rows == Some(0) {
            return Err(Error::InvalidQuery("max rows must be positive".to_string()));
        }
        if let Some(id) = &self.id {
            if id.is_empty() || id.iter().any(Value::is_null) {
                return Err(Error::InvalidQuery("id value is null".to_string()));
            }
        }
        Ok(())
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
