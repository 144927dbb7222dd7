//! Structural plan keys.
//!
//! A key captures everything that changes the generated SQL text and
//! nothing that only changes bind values. Queries with equal keys share one
//! plan. Keys compare structurally; there is no hash-only identity.

use std::fmt::Write;

use beanorm_proto::{BeanQuery, OrderDirection};

/// Structural identity of a query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    bean_type: String,
    select: Vec<String>,
    fetches: Vec<(String, Vec<String>)>,
    by_id: bool,
    where_raw: Option<String>,
    where_shape: Option<String>,
    having_raw: Option<String>,
    having_shape: Option<String>,
    order_by: Vec<(String, bool)>,
    distinct: bool,
    raw_sql: Option<String>,
    first_row: usize,
    max_rows: Option<usize>,
}

impl PlanKey {
    /// Build the key of a query.
    ///
    /// Select and fetch lists are sorted so listing order does not matter.
    /// Raw fragments participate by text, which holds placeholders rather
    /// than values.
    pub fn from_query(query: &BeanQuery) -> Self {
        let mut select = query.select.clone();
        select.sort();

        let mut fetches: Vec<(String, Vec<String>)> = query
            .fetches
            .iter()
            .map(|f| {
                let mut properties = f.properties.clone();
                properties.sort();
                (f.path.clone(), properties)
            })
            .collect();
        fetches.sort();

        Self {
            bean_type: query.bean_type.clone(),
            select,
            fetches,
            by_id: query.id.is_some(),
            where_raw: query.where_raw.as_ref().map(|r| r.sql.clone()),
            where_shape: query.where_expr.as_ref().map(|e| e.shape()),
            having_raw: query.having_raw.as_ref().map(|r| r.sql.clone()),
            having_shape: query.having_expr.as_ref().map(|e| e.shape()),
            order_by: query
                .order_by
                .iter()
                .map(|o| (o.path.clone(), o.direction == OrderDirection::Desc))
                .collect(),
            distinct: query.distinct,
            raw_sql: query.raw_sql.clone(),
            first_row: query.first_row,
            max_rows: query.max_rows,
        }
    }

    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    /// Full text rendering of the key, used for plan ids and query cache keys.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}|sel[{}]", self.bean_type, self.select.join(","));
        for (path, properties) in &self.fetches {
            let _ = write!(out, "|fetch {path}({})", properties.join(","));
        }
        if self.by_id {
            out.push_str("|id");
        }
        if let Some(raw) = &self.where_raw {
            let _ = write!(out, "|wr[{raw}]");
        }
        if let Some(shape) = &self.where_shape {
            let _ = write!(out, "|we[{shape}]");
        }
        if let Some(raw) = &self.having_raw {
            let _ = write!(out, "|hr[{raw}]");
        }
        if let Some(shape) = &self.having_shape {
            let _ = write!(out, "|he[{shape}]");
        }
        for (path, desc) in &self.order_by {
            let _ = write!(out, "|ob {path}{}", if *desc { " desc" } else { "" });
        }
        if self.distinct {
            out.push_str("|distinct");
        }
        if let Some(sql) = &self.raw_sql {
            let _ = write!(out, "|sql[{sql}]");
        }
        let _ = write!(out, "|first {}|max {:?}", self.first_row, self.max_rows);
        out
    }

    /// Short stable identifier for monitoring output.
    pub fn plan_id(&self) -> String {
        let hash = blake3::hash(self.canonical().as_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }
}
