//! Expression tree rendering.
//!
//! SQL text and bind values are produced by separate walks over the same
//! tree. The text is rendered once per plan; values are collected on every
//! execution and must come out in the same order as the `?` markers.

use std::sync::Arc;

use beanorm_proto::{CompareOp, Expr, Value};

use super::compiler::PathColumns;
use super::deploy::DeployParser;
use crate::descriptor::ScalarConverter;
use crate::error::Error;

/// Rendered expression SQL and the converter for each `?` marker.
#[derive(Debug, Default, Clone)]
pub struct RenderedExpr {
    pub sql: String,
    pub converters: Vec<Option<Arc<dyn ScalarConverter>>>,
}

pub(crate) fn render(expr: &Expr, columns: &PathColumns<'_>) -> Result<RenderedExpr, Error> {
    let mut out = RenderedExpr::default();
    render_into(expr, columns, &mut out)?;
    Ok(out)
}

fn needs_parens(expr: &Expr) -> bool {
    matches!(expr, Expr::And(v) | Expr::Or(v) if v.len() > 1) || matches!(expr, Expr::Raw { .. })
}

fn render_into(expr: &Expr, columns: &PathColumns<'_>, out: &mut RenderedExpr) -> Result<(), Error> {
    match expr {
        Expr::Compare { path, op, value } => {
            let column = columns.column(path)?;
            if value.is_null() {
                let test = match op {
                    CompareOp::Eq => "is null",
                    CompareOp::Ne => "is not null",
                    other => {
                        return Err(Error::InvalidQuery(format!(
                            "cannot compare '{path}' {} null",
                            other.sql()
                        )))
                    }
                };
                out.sql.push_str(&format!("{} {test}", column.sql));
            } else {
                out.sql.push_str(&format!("{} {} ?", column.sql, op.sql()));
                out.converters.push(column.converter);
            }
        }
        Expr::Like {
            path,
            case_insensitive,
            ..
        } => {
            let column = columns.column(path)?;
            if *case_insensitive {
                out.sql.push_str(&format!("lower({}) like ?", column.sql));
            } else {
                out.sql.push_str(&format!("{} like ?", column.sql));
            }
            out.converters.push(None);
        }
        Expr::In {
            path,
            values,
            negated,
        } => {
            let column = columns.column(path)?;
            if values.is_empty() {
                out.sql.push_str(if *negated { "1=1" } else { "1=0" });
            } else {
                let marks = vec!["?"; values.len()].join(", ");
                let kind = if *negated { "not in" } else { "in" };
                out.sql.push_str(&format!("{} {kind} ({marks})", column.sql));
                for _ in values {
                    out.converters.push(column.converter.clone());
                }
            }
        }
        Expr::Between { path, .. } => {
            let column = columns.column(path)?;
            out.sql.push_str(&format!("{} between ? and ?", column.sql));
            out.converters.push(column.converter.clone());
            out.converters.push(column.converter);
        }
        Expr::IsNull { path, negated } => {
            let column = columns.column(path)?;
            let test = if *negated { "is not null" } else { "is null" };
            out.sql.push_str(&format!("{} {test}", column.sql));
        }
        Expr::Raw { sql, params } => {
            let parsed = DeployParser::parse(sql, |word| columns.translate(word));
            if parsed.has_named() {
                return Err(Error::InvalidQuery(format!(
                    "named parameters are not supported in expression fragment '{sql}'"
                )));
            }
            if parsed.placeholder_count() != params.len() {
                return Err(Error::InvalidQuery(format!(
                    "fragment '{sql}' has {} placeholders but {} values",
                    parsed.placeholder_count(),
                    params.len()
                )));
            }
            out.sql.push_str(&parsed.sql);
            out.converters.extend(std::iter::repeat(None).take(params.len()));
        }
        Expr::And(exprs) | Expr::Or(exprs) => {
            let is_and = matches!(expr, Expr::And(_));
            if exprs.is_empty() {
                out.sql.push_str(if is_and { "1=1" } else { "1=0" });
                return Ok(());
            }
            for (i, e) in exprs.iter().enumerate() {
                if i > 0 {
                    out.sql.push_str(if is_and { " and " } else { " or " });
                }
                let parens = exprs.len() > 1 && needs_parens(e);
                if parens {
                    out.sql.push('(');
                }
                render_into(e, columns, out)?;
                if parens {
                    out.sql.push(')');
                }
            }
        }
        Expr::Not(inner) => {
            out.sql.push_str("not (");
            render_into(inner, columns, out)?;
            out.sql.push(')');
        }
    }
    Ok(())
}

/// Collect the bind values of `expr` in marker order.
pub(crate) fn collect_values(expr: &Expr, out: &mut Vec<Value>) {
    match expr {
        Expr::Compare { value, .. } => {
            if !value.is_null() {
                out.push(value.clone());
            }
        }
        Expr::Like {
            pattern,
            case_insensitive,
            ..
        } => {
            let pattern = if *case_insensitive {
                pattern.to_lowercase()
            } else {
                pattern.clone()
            };
            out.push(Value::String(pattern));
        }
        Expr::In { values, .. } => out.extend(values.iter().cloned()),
        Expr::Between { low, high, .. } => {
            out.push(low.clone());
            out.push(high.clone());
        }
        Expr::IsNull { .. } => {}
        Expr::Raw { params, .. } => out.extend(params.iter().cloned()),
        Expr::And(exprs) | Expr::Or(exprs) => {
            for e in exprs {
                collect_values(e, out);
            }
        }
        Expr::Not(inner) => collect_values(inner, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LimitOffsetPlatform;
    use crate::sqltree::SqlTreeBuilder;
    use crate::test_support;
    use beanorm_proto::BeanQuery;
    use std::collections::BTreeSet;

    fn render_order(expr: &Expr) -> Result<RenderedExpr, Error> {
        let registry = test_support::registry();
        let root = registry.get("Order").unwrap().clone();
        let paths: BTreeSet<String> = expr.paths().iter().map(|p| p.to_string()).collect();
        let tree = SqlTreeBuilder::new(&registry, &LimitOffsetPlatform)
            .build(&root, &BeanQuery::new("Order"), &paths)
            .unwrap();
        let columns = PathColumns::new(&registry, &root, Some(&tree), &LimitOffsetPlatform);
        render(expr, &columns)
    }

    #[test]
    fn test_render_compare_and_null() {
        let rendered = render_order(&Expr::and(vec![
            Expr::eq("status", "NEW"),
            Expr::eq("customer.name", Value::Null),
        ]))
        .unwrap();
        assert_eq!(rendered.sql, "t0.status = ? and t1.name is null");
        assert_eq!(rendered.converters.len(), 1);

        assert!(render_order(&Expr::gt("status", Value::Null)).is_err());
    }

    #[test]
    fn test_render_in_and_like() {
        let rendered = render_order(&Expr::or(vec![
            Expr::in_values("status", vec!["A".into(), "B".into()]),
            Expr::ilike("customer.name", "Rob%"),
            Expr::in_values("id", vec![]),
        ]))
        .unwrap();
        assert_eq!(
            rendered.sql,
            "t0.status in (?, ?) or lower(t1.name) like ? or 1=0"
        );
        assert_eq!(rendered.converters.len(), 3);
    }

    #[test]
    fn test_render_nested_and_raw() {
        let expr = Expr::and(vec![
            Expr::or(vec![Expr::eq("status", "A"), Expr::eq("status", "B")]),
            Expr::not(Expr::between("id", 1i64, 9i64)),
            Expr::raw("status <> ?", vec!["X".into()]),
        ]);
        let rendered = render_order(&expr).unwrap();
        assert_eq!(
            rendered.sql,
            "(t0.status = ? or t0.status = ?) and not (t0.id between ? and ?) and (t0.status <> ?)"
        );

        let mut values = Vec::new();
        collect_values(&expr, &mut values);
        assert_eq!(values.len(), rendered.converters.len());
    }

    #[test]
    fn test_raw_placeholder_mismatch() {
        let err = render_order(&Expr::raw("status = ?", vec![])).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_ilike_lowercases_pattern() {
        let mut values = Vec::new();
        collect_values(&Expr::ilike("name", "RoB%"), &mut values);
        assert_eq!(values, vec![Value::String("rob%".into())]);
    }
}
