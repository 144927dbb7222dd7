//! The SQL tree: the join structure of one query shape.
//!
//! The tree fixes which tables are joined, which columns are selected and
//! in what order, and how a row is read back into beans. It is built once
//! per query plan and shared read-only by every execution of that plan.

mod builder;
mod node;

use std::collections::{BTreeSet, HashMap};

pub use builder::SqlTreeBuilder;
pub use node::{NodeKind, SqlTreeNode};

use crate::bean::{Bean, BeanId};
use crate::connection::ResultSet;
use crate::error::Error;

/// Join structure and select list of a query.
#[derive(Debug)]
pub struct SqlTree {
    root: SqlTreeNode,
    many_path: Option<String>,
    many_offset: usize,
    requires_distinct: bool,
    path_aliases: HashMap<String, String>,
    dependent_tables: BTreeSet<String>,
    columns: Vec<String>,
    from: String,
}

impl SqlTree {
    pub(crate) fn new(
        root: SqlTreeNode,
        many_path: Option<String>,
        requires_distinct: bool,
        path_aliases: HashMap<String, String>,
        dependent_tables: BTreeSet<String>,
    ) -> Self {
        let mut columns = Vec::new();
        let mut from = String::new();
        root.visit(&mut |node| {
            columns.extend(node.columns.iter().cloned());
            match &node.join {
                Some(join) => {
                    from.push(' ');
                    from.push_str(join);
                }
                None => {
                    from.push_str(node.descriptor.table());
                    from.push(' ');
                    from.push_str(&node.alias);
                }
            }
            for join in &node.formula_joins {
                from.push(' ');
                from.push_str(join);
            }
        });

        let many_offset = match &many_path {
            Some(path) => {
                let before: usize = root
                    .children
                    .iter()
                    .take_while(|c| &c.path != path)
                    .map(SqlTreeNode::width)
                    .sum();
                root.columns.len() + before
            }
            None => 0,
        };

        Self {
            root,
            many_path,
            many_offset,
            requires_distinct,
            path_aliases,
            dependent_tables,
            columns,
            from,
        }
    }

    pub fn root(&self) -> &SqlTreeNode {
        &self.root
    }

    /// Path of the join fetched to-many, if any.
    pub fn many_path(&self) -> Option<&str> {
        self.many_path.as_deref()
    }

    /// Column position where the to-many node's columns start.
    pub fn many_offset(&self) -> usize {
        self.many_offset
    }

    /// The join fetched to-many node.
    pub fn many_node(&self) -> Option<&SqlTreeNode> {
        let path = self.many_path.as_deref()?;
        self.root.children.iter().find(|c| c.path == path)
    }

    /// Whether a to-many join was added for predicates only, so the
    /// statement needs `distinct` to avoid duplicate root rows.
    pub fn requires_distinct(&self) -> bool {
        self.requires_distinct
    }

    /// Table alias for an association path ("" is the root).
    pub fn alias_for(&self, path: &str) -> Option<&str> {
        self.path_aliases.get(path).map(String::as_str)
    }

    /// Lower cased tables the query reads, including intersection tables.
    pub fn dependent_tables(&self) -> &BTreeSet<String> {
        &self.dependent_tables
    }

    /// Number of selected columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Select list. With `alias_columns` every expression gets a unique
    /// column alias (`c0`, `c1`, ..).
    pub fn select_clause(&self, alias_columns: bool) -> String {
        if alias_columns {
            self.columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c} c{i}"))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            self.columns.join(", ")
        }
    }

    /// From clause including every join.
    pub fn from_clause(&self) -> &str {
        &self.from
    }

    /// Read the root bean id of the current row.
    pub(crate) fn read_root_id(&self, rs: &dyn ResultSet) -> Result<Option<BeanId>, Error> {
        self.root.read_id(rs, 0)
    }

    /// Load the root bean (with fetched to-ones) and the detail bean of the
    /// current row.
    pub(crate) fn load_root(&self, rs: &dyn ResultSet) -> Result<(Option<Bean>, Option<Bean>), Error> {
        let mut col = 0;
        let mut detail = None;
        let root = self.root.load(rs, &mut col, &mut detail)?;
        Ok((root, detail))
    }

    /// Load only the detail bean of the current row.
    pub(crate) fn load_detail(&self, rs: &dyn ResultSet) -> Result<Option<Bean>, Error> {
        let Some(node) = self.many_node() else {
            return Ok(None);
        };
        let mut col = self.many_offset;
        let mut ignored = None;
        node.load(rs, &mut col, &mut ignored)
    }
}
