//! Predicate compilation.

use std::collections::BTreeSet;
use std::sync::Arc;

use beanorm_proto::{BeanQuery, OrderDirection, RawClause, Value};

use super::deploy::{DeployParser, ParamRef, ParsedClause};
use super::expr::{collect_values, render, RenderedExpr};
use super::order::{repair_order, ManyOrder};
use crate::descriptor::{
    resolve_path, with_alias, BeanDescriptor, DescriptorRegistry, ScalarConverter, Terminal,
};
use crate::error::Error;
use crate::platform::DatabasePlatform;
use crate::sqltree::SqlTree;

/// A column expression for a property path.
#[derive(Debug, Clone)]
pub(crate) struct ColumnRef {
    pub sql: String,
    pub converter: Option<Arc<dyn ScalarConverter>>,
}

/// Maps property paths to column expressions of one tree.
///
/// Without a tree (raw SQL queries) columns are unqualified and paths that
/// need a join are rejected.
pub(crate) struct PathColumns<'a> {
    registry: &'a DescriptorRegistry,
    root: &'a BeanDescriptor,
    tree: Option<&'a SqlTree>,
    platform: &'a dyn DatabasePlatform,
}

impl<'a> PathColumns<'a> {
    pub(crate) fn new(
        registry: &'a DescriptorRegistry,
        root: &'a BeanDescriptor,
        tree: Option<&'a SqlTree>,
        platform: &'a dyn DatabasePlatform,
    ) -> Self {
        Self {
            registry,
            root,
            tree,
            platform,
        }
    }

    pub(crate) fn column(&self, path: &str) -> Result<ColumnRef, Error> {
        let resolved = resolve_path(self.registry, self.root, path)?;
        let alias = match self.tree {
            Some(tree) => Some(tree.alias_for(&resolved.node_path).ok_or_else(|| {
                Error::InvalidQuery(format!("no join available for '{path}'"))
            })?),
            None if resolved.joins.is_empty() => None,
            None => {
                return Err(Error::InvalidQuery(format!(
                    "'{path}' needs a join which raw sql queries cannot add"
                )))
            }
        };
        let qualify = |column: &str| match alias {
            Some(alias) => format!("{alias}.{column}"),
            None => column.to_string(),
        };

        match resolved.terminal {
            Terminal::Scalar {
                column,
                encrypted,
                converter,
            } => {
                let column = qualify(&column);
                let sql = if encrypted {
                    self.platform.decrypt_expression(&column)
                } else {
                    column
                };
                Ok(ColumnRef { sql, converter })
            }
            Terminal::Formula { select, .. } => Ok(ColumnRef {
                sql: with_alias(&select, alias.unwrap_or(self.root.table())),
                converter: None,
            }),
            Terminal::Columns(columns) if columns.len() == 1 => Ok(ColumnRef {
                sql: qualify(&columns[0]),
                converter: None,
            }),
            Terminal::Columns(_) => Err(Error::InvalidQuery(format!(
                "'{path}' maps to several columns and cannot be used in a predicate"
            ))),
        }
    }

    /// Column expression for a word of a raw fragment, if it names a property.
    pub(crate) fn translate(&self, word: &str) -> Option<String> {
        self.column(word).ok().map(|c| c.sql)
    }
}

/// Where, having and order by SQL of one plan, plus what is needed to bind
/// each execution's values in the same order.
#[derive(Debug, Default)]
pub struct CompiledPredicates {
    pub where_sql: Option<String>,
    pub having_sql: Option<String>,
    pub order_sql: Option<String>,
    pub(crate) id_converters: Vec<Option<Arc<dyn ScalarConverter>>>,
    pub(crate) where_params: Vec<ParamRef>,
    pub(crate) where_expr: RenderedExpr,
    pub(crate) having_params: Vec<ParamRef>,
    pub(crate) having_expr: RenderedExpr,
}

/// Values bound to one execution, in binding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindValues {
    pub values: Vec<Value>,
}

impl BindValues {
    /// Bind values formatted for error messages and logs.
    pub fn log(&self) -> String {
        let items: Vec<String> = self
            .values
            .iter()
            .map(|v| match v {
                Value::String(s) => format!("'{s}'"),
                other => other.to_string(),
            })
            .collect();
        format!("[{}]", items.join(", "))
    }
}

/// Translates logical predicates into column SQL and bind values.
pub struct PredicateCompiler<'a> {
    registry: &'a DescriptorRegistry,
    platform: &'a dyn DatabasePlatform,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(registry: &'a DescriptorRegistry, platform: &'a dyn DatabasePlatform) -> Self {
        Self { registry, platform }
    }

    /// Property paths referenced by the query's where, having and order by
    /// clauses, including names found in raw fragments.
    pub fn referenced_paths(&self, root: &BeanDescriptor, query: &BeanQuery) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        let collect_raw = |sql: &str, paths: &mut BTreeSet<String>| {
            DeployParser::parse(sql, |word| {
                if resolve_path(self.registry, root, word).is_ok() {
                    paths.insert(word.to_string());
                }
                None
            });
        };

        for expr in query.where_expr.iter().chain(query.having_expr.iter()) {
            paths.extend(expr.paths().into_iter().map(str::to_string));
            for fragment in expr.raw_fragments() {
                collect_raw(fragment, &mut paths);
            }
        }
        for clause in query.where_raw.iter().chain(query.having_raw.iter()) {
            collect_raw(&clause.sql, &mut paths);
        }
        for order in &query.order_by {
            paths.insert(order.path.clone());
        }
        paths
    }

    /// Compile the clauses of `query` against `tree`.
    pub fn compile(&self, root: &BeanDescriptor, query: &BeanQuery, tree: &SqlTree) -> Result<CompiledPredicates, Error> {
        let qualified = query.raw_sql.is_none();
        let columns = PathColumns::new(self.registry, root, qualified.then_some(tree), self.platform);
        let mut compiled = CompiledPredicates::default();

        let mut where_parts = Vec::new();
        if let Some(id) = &query.id {
            let ids = root.id_properties();
            if id.len() != ids.len() {
                return Err(Error::InvalidQuery(format!(
                    "{} takes {} id values but {} were given",
                    root.name(),
                    ids.len(),
                    id.len()
                )));
            }
            let mut conditions = Vec::new();
            for prop in ids {
                let column = columns.column(&prop.name)?;
                conditions.push(format!("{} = ?", column.sql));
                compiled.id_converters.push(column.converter);
            }
            where_parts.push(conditions.join(" and "));
        }
        if let Some(raw) = &query.where_raw {
            if !raw.sql.trim().is_empty() {
                let parsed = DeployParser::parse(&raw.sql, |w| columns.translate(w));
                where_parts.push(format!("({})", parsed.sql));
                compiled.where_params = parsed.params;
            }
        }
        if let Some(expr) = &query.where_expr {
            let rendered = render(expr, &columns)?;
            where_parts.push(if query.id.is_some() || query.where_raw.is_some() {
                format!("({})", rendered.sql)
            } else {
                rendered.sql.clone()
            });
            compiled.where_expr = rendered;
        }
        if !where_parts.is_empty() {
            compiled.where_sql = Some(where_parts.join(" and "));
        }

        let mut having_parts = Vec::new();
        if let Some(raw) = &query.having_raw {
            if !raw.sql.trim().is_empty() {
                let ParsedClause { sql, params } = DeployParser::parse(&raw.sql, |w| columns.translate(w));
                having_parts.push(sql);
                compiled.having_params = params;
            }
        }
        if let Some(expr) = &query.having_expr {
            let rendered = render(expr, &columns)?;
            having_parts.push(rendered.sql.clone());
            compiled.having_expr = rendered;
        }
        if !having_parts.is_empty() {
            compiled.having_sql = Some(having_parts.join(" and "));
        }

        compiled.order_sql = self.order_sql(root, query, tree, &columns)?;
        Ok(compiled)
    }

    fn order_sql(
        &self,
        root: &BeanDescriptor,
        query: &BeanQuery,
        tree: &SqlTree,
        columns: &PathColumns<'_>,
    ) -> Result<Option<String>, Error> {
        let many = tree.many_path().map(|path| ManyOrder {
            path,
            default_order: root
                .property(path)
                .and_then(|p| p.as_many())
                .and_then(|m| m.order_by.as_deref()),
        });
        let ids: Vec<&str> = root.id_properties().iter().map(|p| p.name.as_str()).collect();
        let order = repair_order(&query.order_by, &ids, many);
        if order.is_empty() {
            return Ok(None);
        }
        let mut items = Vec::with_capacity(order.len());
        for spec in &order {
            let column = columns.column(&spec.path)?;
            items.push(match spec.direction {
                OrderDirection::Asc => column.sql,
                OrderDirection::Desc => format!("{} desc", column.sql),
            });
        }
        Ok(Some(items.join(", ")))
    }

    /// Extract this execution's bind values. Runs on every execution, plan
    /// cache hit or not.
    pub fn bind_values(&self, query: &BeanQuery, compiled: &CompiledPredicates) -> Result<BindValues, Error> {
        let mut values = Vec::new();

        if let Some(id) = &query.id {
            for (value, converter) in id.iter().zip(&compiled.id_converters) {
                values.push(bind(converter.as_ref(), value)?);
            }
        }
        if let Some(raw) = &query.where_raw {
            bind_params(raw, &compiled.where_params, &mut values)?;
        }
        if let Some(expr) = &query.where_expr {
            bind_expr(expr, &compiled.where_expr, &mut values)?;
        }
        if let Some(raw) = &query.having_raw {
            bind_params(raw, &compiled.having_params, &mut values)?;
        }
        if let Some(expr) = &query.having_expr {
            bind_expr(expr, &compiled.having_expr, &mut values)?;
        }
        Ok(BindValues { values })
    }
}

fn bind(converter: Option<&Arc<dyn ScalarConverter>>, value: &Value) -> Result<Value, Error> {
    match converter {
        Some(c) => c.bind(value),
        None => Ok(value.clone()),
    }
}

fn bind_params(clause: &RawClause, params: &[ParamRef], out: &mut Vec<Value>) -> Result<(), Error> {
    for param in params {
        let value = match param {
            ParamRef::Named(name) => clause.named.get(name).ok_or_else(|| {
                Error::InvalidQuery(format!("no value bound for named parameter '{name}'"))
            })?,
            ParamRef::Positional(i) => clause.positional.get(*i).ok_or_else(|| {
                Error::InvalidQuery(format!("no value bound for positional parameter {}", i + 1))
            })?,
        };
        out.push(value.clone());
    }
    Ok(())
}

fn bind_expr(expr: &beanorm_proto::Expr, rendered: &RenderedExpr, out: &mut Vec<Value>) -> Result<(), Error> {
    let mut raw = Vec::new();
    collect_values(expr, &mut raw);
    if raw.len() != rendered.converters.len() {
        return Err(Error::InvalidQuery(format!(
            "expression binds {} values but its sql has {} placeholders",
            raw.len(),
            rendered.converters.len()
        )));
    }
    for (value, converter) in raw.iter().zip(&rendered.converters) {
        out.push(bind(converter.as_ref(), value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LimitOffsetPlatform;
    use crate::sqltree::SqlTreeBuilder;
    use crate::test_support;
    use beanorm_proto::{Expr, OrderSpec};

    fn compile(query: &BeanQuery) -> Result<(CompiledPredicates, BindValues, SqlTree), Error> {
        let registry = test_support::registry();
        let root = registry.get(&query.bean_type)?.clone();
        let compiler = PredicateCompiler::new(&registry, &LimitOffsetPlatform);
        let paths = compiler.referenced_paths(&root, query);
        let tree = SqlTreeBuilder::new(&registry, &LimitOffsetPlatform).build(&root, query, &paths)?;
        let compiled = compiler.compile(&root, query, &tree)?;
        let binds = compiler.bind_values(query, &compiled)?;
        Ok((compiled, binds, tree))
    }

    #[test]
    fn test_referenced_paths() {
        let registry = test_support::registry();
        let root = registry.get("Order").unwrap();
        let query = BeanQuery::new("Order")
            .where_raw("customer.name like :n and lower(status) = ?")
            .filter(Expr::gt("details.qty", 2))
            .order_by(OrderSpec::asc("customer.email"));
        let paths = PredicateCompiler::new(&registry, &LimitOffsetPlatform).referenced_paths(root, &query);
        let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
        assert_eq!(paths, vec!["customer.email", "customer.name", "details.qty", "status"]);
    }

    #[test]
    fn test_bind_order() {
        let query = BeanQuery::new("Order")
            .with_id(5i64)
            .where_raw("status = :s or customer.name = ?")
            .set_parameter("s", "NEW")
            .add_parameter("Rob")
            .filter(Expr::in_values("status", vec!["A".into(), "B".into()]))
            .having_raw(RawClause {
                sql: "count(*) > :min".into(),
                named: [("min".to_string(), Value::Int64(1))].into_iter().collect(),
                positional: vec![],
            })
            .having(Expr::lt("id", 100i64));

        let (compiled, binds, _) = compile(&query).unwrap();
        assert_eq!(
            compiled.where_sql.as_deref(),
            Some("t0.id = ? and (t0.status = ? or t1.name = ?) and (t0.status in (?, ?))")
        );
        assert_eq!(compiled.having_sql.as_deref(), Some("count(*) > ? and t0.id < ?"));
        assert_eq!(
            binds.values,
            vec![
                Value::Int64(5),
                Value::from("NEW"),
                Value::from("Rob"),
                Value::from("A"),
                Value::from("B"),
                Value::Int64(1),
                Value::Int64(100),
            ]
        );
        assert_eq!(binds.log(), "[5, 'NEW', 'Rob', 'A', 'B', 1, 100]");
    }

    #[test]
    fn test_missing_named_parameter() {
        let query = BeanQuery::new("Order").where_raw("status = :s");
        let err = compile(&query).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(ref m) if m.contains("'s'")));
    }

    #[test]
    fn test_converter_applied_to_binds() {
        let query = BeanQuery::new("Animal").filter(Expr::eq("indoor", true));
        let (compiled, binds, _) = compile(&query).unwrap();
        assert_eq!(compiled.where_sql.as_deref(), Some("t0.indoor = ?"));
        assert_eq!(binds.values, vec![Value::Int32(1)]);
    }

    #[test]
    fn test_order_repaired_for_many() {
        let query = BeanQuery::new("Order")
            .fetch("details")
            .order_by(OrderSpec::desc("details.qty"));
        let (compiled, _, _) = compile(&query).unwrap();
        assert_eq!(compiled.order_sql.as_deref(), Some("t0.id, t1.qty desc"));

        let (plain, _, _) = compile(&BeanQuery::new("Order").fetch("details")).unwrap();
        assert_eq!(plain.order_sql.as_deref(), Some("t0.id, t1.id"));
    }

    #[test]
    fn test_raw_sql_columns_unqualified() {
        let query = BeanQuery::new("Order")
            .with_raw_sql("select o.id, o.status, o.customer_id from o_order o")
            .filter(Expr::eq("status", "NEW"));
        let (compiled, _, _) = compile(&query).unwrap();
        assert_eq!(compiled.where_sql.as_deref(), Some("status = ?"));

        let joined = BeanQuery::new("Order")
            .with_raw_sql("select o.id from o_order o")
            .filter(Expr::eq("customer.name", "x"));
        assert!(matches!(compile(&joined).unwrap_err(), Error::InvalidQuery(_)));
    }

    #[test]
    fn test_same_shape_rebinds() {
        let registry = test_support::registry();
        let root = registry.get("Order").unwrap().clone();
        let compiler = PredicateCompiler::new(&registry, &LimitOffsetPlatform);
        let first = BeanQuery::new("Order").filter(Expr::eq("status", "A"));
        let second = BeanQuery::new("Order").filter(Expr::eq("status", "B"));
        let tree = SqlTreeBuilder::new(&registry, &LimitOffsetPlatform)
            .build(&root, &first, &compiler.referenced_paths(&root, &first))
            .unwrap();
        let compiled = compiler.compile(&root, &first, &tree).unwrap();
        assert_eq!(
            compiler.bind_values(&second, &compiled).unwrap().values,
            vec![Value::from("B")]
        );
    }
}
