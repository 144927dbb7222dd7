//! Compiled query plans.

use std::collections::BTreeSet;
use std::sync::Arc;

use beanorm_proto::BeanQuery;
use tracing::debug;

use super::key::PlanKey;
use super::statistics::{PlanStatistics, StatisticsSnapshot};
use crate::descriptor::{resolve_path, BeanDescriptor, DescriptorRegistry};
use crate::error::Error;
use crate::platform::DatabasePlatform;
use crate::predicate::{BindValues, CompiledPredicates, PredicateCompiler};
use crate::sqltree::{NodeKind, SqlTree, SqlTreeBuilder};

/// SQL text and tree of one query shape, shared by every execution of it.
///
/// Everything except the statistics is immutable after compilation.
#[derive(Debug)]
pub struct QueryPlan {
    key: PlanKey,
    plan_id: String,
    descriptor: Arc<BeanDescriptor>,
    sql: String,
    tree: SqlTree,
    predicates: CompiledPredicates,
    uses_row_number: bool,
    is_raw_sql: bool,
    row_limited: bool,
    statistics: PlanStatistics,
}

fn has_where_keyword(sql: &str) -> bool {
    sql.split(|c: char| c.is_whitespace() || c == ')' || c == '(')
        .any(|w| w.eq_ignore_ascii_case("where"))
}

fn is_extra_join(tree: &SqlTree, path: &str) -> bool {
    let mut found = false;
    tree.root().visit(&mut |node| {
        if node.path() == path && matches!(node.kind(), NodeKind::ExtraJoin { .. }) {
            found = true;
        }
    });
    found
}

/// With `select distinct`, every order by column must be selected, so order
/// by paths may not go through a join that selects nothing.
fn check_distinct_order(
    registry: &DescriptorRegistry,
    descriptor: &BeanDescriptor,
    query: &BeanQuery,
    tree: &SqlTree,
) -> Result<(), Error> {
    for spec in &query.order_by {
        let resolved = resolve_path(registry, descriptor, &spec.path)?;
        if let Some(step) = resolved.joins.iter().find(|step| is_extra_join(tree, &step.path)) {
            return Err(Error::InvalidQuery(format!(
                "cannot order a distinct query by '{}': '{}' is joined for predicates only, fetch it to order by it",
                spec.path, step.path
            )));
        }
    }
    Ok(())
}

impl QueryPlan {
    /// Build the tree, compile predicates and assemble the SQL for `query`.
    pub fn compile(
        registry: &DescriptorRegistry,
        platform: &dyn DatabasePlatform,
        query: &BeanQuery,
        key: PlanKey,
    ) -> Result<Self, Error> {
        query.validate()?;
        let descriptor = Arc::clone(registry.get(&query.bean_type)?);
        if query.raw_sql.is_some() && !query.fetches.is_empty() {
            return Err(Error::InvalidQuery(
                "raw sql queries cannot join fetch associations".to_string(),
            ));
        }

        let compiler = PredicateCompiler::new(registry, platform);
        let paths = compiler.referenced_paths(&descriptor, query);
        let tree = SqlTreeBuilder::new(registry, platform).build(&descriptor, query, &paths)?;
        let predicates = compiler.compile(&descriptor, query, &tree)?;
        let distinct = query.raw_sql.is_none() && (tree.requires_distinct() || query.distinct);
        if distinct {
            check_distinct_order(registry, &descriptor, query, &tree)?;
        }

        let mut sql = match &query.raw_sql {
            Some(raw) => {
                let raw = raw.trim();
                let mut sql = raw.to_string();
                if let Some(where_sql) = &predicates.where_sql {
                    let keyword = if has_where_keyword(raw) { "and" } else { "where" };
                    sql.push_str(&format!(" {keyword} {where_sql}"));
                }
                sql
            }
            None => {
                let distinct = if distinct { "distinct " } else { "" };
                let mut sql = format!(
                    "select {distinct}{} from {}",
                    tree.select_clause(platform.requires_column_alias()),
                    tree.from_clause()
                );
                if let Some(where_sql) = &predicates.where_sql {
                    sql.push_str(&format!(" where {where_sql}"));
                }
                sql
            }
        };
        if let Some(having) = &predicates.having_sql {
            sql.push_str(&format!(" having {having}"));
        }
        if let Some(order) = &predicates.order_sql {
            sql.push_str(&format!(" order by {order}"));
        }

        // With a to-many fetched, sql rows are not beans; limits apply per
        // master in the reader.
        let row_limited =
            tree.many_path().is_none() && (query.first_row > 0 || query.max_rows.is_some());
        let uses_row_number = if row_limited {
            let limited = platform.apply_limit(sql, query.first_row, query.max_rows);
            sql = limited.sql;
            limited.uses_row_number
        } else {
            false
        };

        let plan_id = key.plan_id();
        debug!(
            plan_id = %plan_id,
            bean = %descriptor.name(),
            platform = platform.name(),
            sql = %sql,
            "Compiled query plan"
        );

        Ok(Self {
            key,
            plan_id,
            descriptor,
            sql,
            tree,
            predicates,
            uses_row_number,
            is_raw_sql: query.raw_sql.is_some(),
            row_limited,
            statistics: PlanStatistics::new(),
        })
    }

    pub fn key(&self) -> &PlanKey {
        &self.key
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn bean_type(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<BeanDescriptor> {
        &self.descriptor
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn tree(&self) -> &SqlTree {
        &self.tree
    }

    pub fn predicates(&self) -> &CompiledPredicates {
        &self.predicates
    }

    /// The statement was wrapped to filter on a row number.
    pub fn uses_row_number(&self) -> bool {
        self.uses_row_number
    }

    pub fn is_raw_sql(&self) -> bool {
        self.is_raw_sql
    }

    /// The SQL itself skips `first_row` rows and stops after `max_rows + 1`.
    pub fn is_row_limited(&self) -> bool {
        self.row_limited
    }

    /// Tables whose changes make cached results of this plan stale.
    pub fn dependent_tables(&self) -> &BTreeSet<String> {
        self.tree.dependent_tables()
    }

    /// Extract bind values for one execution.
    pub fn bind_values(
        &self,
        registry: &DescriptorRegistry,
        platform: &dyn DatabasePlatform,
        query: &BeanQuery,
    ) -> Result<BindValues, Error> {
        PredicateCompiler::new(registry, platform).bind_values(query, &self.predicates)
    }

    pub fn statistics(&self) -> &PlanStatistics {
        &self.statistics
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.statistics
            .snapshot(&self.plan_id, self.descriptor.name(), &self.sql)
    }
}
