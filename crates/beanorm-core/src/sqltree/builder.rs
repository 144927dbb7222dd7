//! SQL tree construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use beanorm_proto::BeanQuery;
use tracing::{debug, warn};

use super::node::{NodeKind, ReadSlot, SlotKind, SqlTreeNode};
use super::SqlTree;
use crate::descriptor::{
    resolve_include, resolve_path, with_alias, AssocMany, AssocOne, BeanDescriptor, BeanProperty,
    DescriptorRegistry, PropertyKind, Terminal,
};
use crate::error::Error;
use crate::platform::DatabasePlatform;

/// Builds the [`SqlTree`] for one query shape.
pub struct SqlTreeBuilder<'a> {
    registry: &'a DescriptorRegistry,
    platform: &'a dyn DatabasePlatform,
}

#[derive(Default)]
struct BuildContext {
    next_alias: usize,
    many: Option<String>,
    aliases: HashMap<String, String>,
    tables: BTreeSet<String>,
    requires_distinct: bool,
}

impl BuildContext {
    fn allocate(&mut self, path: &str, table: &str) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        self.aliases.insert(path.to_string(), alias.clone());
        self.tables.insert(table.to_ascii_lowercase());
        alias
    }
}

/// How a child node attaches to its parent.
enum Attach<'a> {
    One(&'a AssocOne),
    Many(&'a AssocMany),
}

fn parent_path(path: &str) -> (&str, &str) {
    match path.rfind('.') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

impl<'a> SqlTreeBuilder<'a> {
    pub fn new(registry: &'a DescriptorRegistry, platform: &'a dyn DatabasePlatform) -> Self {
        Self { registry, platform }
    }

    /// Build the tree for `query` rooted at `root`.
    ///
    /// `predicate_paths` are the property paths referenced by where, having
    /// and order by clauses; paths not covered by fetched nodes get extra
    /// joins.
    pub fn build(
        &self,
        root: &Arc<BeanDescriptor>,
        query: &BeanQuery,
        predicate_paths: &BTreeSet<String>,
    ) -> Result<SqlTree, Error> {
        let includes = self.includes(root, query)?;
        let root_partial = if query.select.is_empty() {
            None
        } else {
            for name in &query.select {
                if root.property_any(name).is_none() {
                    return Err(Error::UnknownProperty {
                        bean: root.name().to_string(),
                        path: name.clone(),
                    });
                }
            }
            Some(query.select.as_slice())
        };

        let mut ctx = BuildContext::default();
        let mut tree_root = self.build_node(
            root,
            "",
            NodeKind::Root,
            false,
            None,
            root_partial,
            None,
            &includes,
            &mut ctx,
        )?;

        for path in predicate_paths {
            self.add_predicate_joins(root, &mut tree_root, path, &mut ctx)?;
        }

        let tree = SqlTree::new(
            tree_root,
            ctx.many,
            ctx.requires_distinct,
            ctx.aliases,
            ctx.tables,
        );
        debug!(
            bean = %root.name(),
            columns = tree.column_count(),
            many = ?tree.many_path(),
            distinct = tree.requires_distinct(),
            "Built sql tree"
        );
        Ok(tree)
    }

    /// Validate include paths and collect them with their partial property
    /// lists. Prefixes of an include path are included too.
    fn includes(
        &self,
        root: &BeanDescriptor,
        query: &BeanQuery,
    ) -> Result<BTreeMap<String, Option<Vec<String>>>, Error> {
        let mut includes = BTreeMap::new();
        for fetch in &query.fetches {
            let (target, steps) = resolve_include(self.registry, root, &fetch.path)?;
            for name in &fetch.properties {
                if target.property_any(name).is_none() {
                    return Err(Error::UnknownProperty {
                        bean: root.name().to_string(),
                        path: child_path(&fetch.path, name),
                    });
                }
            }
            for step in &steps[..steps.len().saturating_sub(1)] {
                includes.entry(step.path.clone()).or_insert(None);
            }
            let partial = if fetch.properties.is_empty() {
                None
            } else {
                Some(fetch.properties.clone())
            };
            includes.insert(fetch.path.clone(), partial);
        }
        Ok(includes)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_node(
        &self,
        desc: &Arc<BeanDescriptor>,
        path: &str,
        kind: NodeKind,
        outer: bool,
        attach: Option<(&str, Attach<'_>, &BeanDescriptor)>,
        partial: Option<&[String]>,
        back_reference: Option<&str>,
        includes: &BTreeMap<String, Option<Vec<String>>>,
        ctx: &mut BuildContext,
    ) -> Result<SqlTreeNode, Error> {
        let alias = ctx.allocate(path, desc.table());
        let join = attach.map(|(parent_alias, assoc, parent)| {
            let keyword = if outer { "left join" } else { "join" };
            match assoc {
                Attach::One(one) => one_join(keyword, desc, &alias, parent_alias, one, parent),
                Attach::Many(many) => {
                    if let Some(link) = &many.intersection {
                        ctx.tables.insert(link.table.to_ascii_lowercase());
                    }
                    many_join(keyword, desc, &alias, parent_alias, many, parent)
                }
            }
        });

        // Decide which associations become child nodes.
        let mut fetched_ones = BTreeSet::new();
        let mut child_plans = Vec::new();
        for prop in desc.properties() {
            let path_here = child_path(path, &prop.name);
            if !includes.contains_key(&path_here) {
                continue;
            }
            match &prop.kind {
                PropertyKind::One(_) => {
                    fetched_ones.insert(prop.name.as_str());
                    child_plans.push((prop, path_here));
                }
                PropertyKind::Many(_) => {
                    if !path.is_empty() {
                        warn!(
                            bean = %desc.name(),
                            path = %path_here,
                            "Nested to-many fetch rejected; only to-manys on the root can be join fetched"
                        );
                    } else if let Some(existing) = &ctx.many {
                        warn!(
                            path = %path_here,
                            fetched = %existing,
                            "Second to-many fetch rejected; only one to-many can be join fetched"
                        );
                    } else {
                        ctx.many = Some(path_here.clone());
                        child_plans.push((prop, path_here));
                    }
                }
                _ => {}
            }
        }

        let mut node = SqlTreeNode {
            path: path.to_string(),
            alias: alias.clone(),
            descriptor: Arc::clone(desc),
            kind,
            outer,
            discriminator: false,
            columns: Vec::new(),
            slots: Vec::new(),
            join,
            formula_joins: Vec::new(),
            back_reference: back_reference.map(str::to_string),
            children: Vec::new(),
        };

        if let Some(inherit) = desc.inheritance() {
            node.discriminator = true;
            node.columns.push(format!("{alias}.{}", inherit.column));
        }
        for column in desc.id_columns() {
            node.columns.push(format!("{alias}.{column}"));
        }

        let wanted = |name: &str| partial.map_or(true, |p| p.iter().any(|n| n == name));
        for prop in desc.properties().iter().filter(|p| !p.is_id()) {
            if wanted(&prop.name)
                && !fetched_ones.contains(prop.name.as_str())
                && back_reference != Some(prop.name.as_str())
            {
                self.select_property(&mut node, prop, None);
            }
        }
        if let Some(inherit) = desc.inheritance() {
            for sub in &inherit.subtypes {
                for prop in &sub.properties {
                    if wanted(&prop.name) {
                        self.select_property(&mut node, prop, Some(&sub.name));
                    }
                }
            }
        }

        for (prop, path_here) in child_plans {
            let partial = includes.get(&path_here).and_then(|p| p.as_deref());
            let child = match &prop.kind {
                PropertyKind::One(one) => {
                    let target = self.registry.get(&one.target)?;
                    let child_outer = outer || one.nullable || !one.is_owning();
                    self.build_node(
                        target,
                        &path_here,
                        NodeKind::One {
                            property: prop.name.clone(),
                        },
                        child_outer,
                        Some((alias.as_str(), Attach::One(one), desc.as_ref())),
                        partial,
                        None,
                        includes,
                        ctx,
                    )?
                }
                PropertyKind::Many(many) => {
                    let target = self.registry.get(&many.target)?;
                    let back = if many.many_to_many {
                        None
                    } else {
                        many.mapped_by.as_deref()
                    };
                    self.build_node(
                        target,
                        &path_here,
                        NodeKind::Many {
                            property: prop.name.clone(),
                            collection: many.kind.clone(),
                            many_to_many: many.many_to_many,
                        },
                        true,
                        Some((alias.as_str(), Attach::Many(many), desc.as_ref())),
                        partial,
                        back,
                        includes,
                        ctx,
                    )?
                }
                _ => continue,
            };
            node.children.push(child);
        }

        Ok(node)
    }

    fn select_property(&self, node: &mut SqlTreeNode, prop: &BeanProperty, subtype: Option<&str>) {
        let alias = node.alias.clone();
        let subtype = subtype.map(str::to_string);
        match &prop.kind {
            PropertyKind::Scalar(scalar) => {
                let column = format!("{alias}.{}", scalar.column);
                node.columns.push(if scalar.encrypted {
                    self.platform.decrypt_expression(&column)
                } else {
                    column
                });
                node.slots.push(ReadSlot {
                    property: prop.name.clone(),
                    kind: SlotKind::Scalar(scalar.converter.clone()),
                    width: 1,
                    subtype,
                });
            }
            PropertyKind::Formula(formula) => {
                node.columns.push(with_alias(&formula.select, &alias));
                if let Some(join) = &formula.join {
                    add_formula_join(node, join);
                }
                node.slots.push(ReadSlot {
                    property: prop.name.clone(),
                    kind: SlotKind::Scalar(None),
                    width: 1,
                    subtype,
                });
            }
            PropertyKind::Embedded(fields) => {
                for field in fields {
                    node.columns.push(format!("{alias}.{}", field.column));
                }
                node.slots.push(ReadSlot {
                    property: prop.name.clone(),
                    kind: SlotKind::Embedded(fields.iter().map(|f| f.name.clone()).collect()),
                    width: fields.len(),
                    subtype,
                });
            }
            PropertyKind::One(one) if one.is_owning() => {
                for column in &one.join_columns {
                    node.columns.push(format!("{alias}.{column}"));
                }
                node.slots.push(ReadSlot {
                    property: prop.name.clone(),
                    kind: SlotKind::Reference(one.target.clone()),
                    width: one.join_columns.len(),
                    subtype,
                });
            }
            // Inverse to-ones have no local column; to-manys load lazily.
            PropertyKind::One(_) | PropertyKind::Many(_) => {}
        }
    }

    /// Add extra join nodes (and formula joins) needed by one predicate path.
    fn add_predicate_joins(
        &self,
        root: &Arc<BeanDescriptor>,
        tree_root: &mut SqlTreeNode,
        path: &str,
        ctx: &mut BuildContext,
    ) -> Result<(), Error> {
        let resolved = resolve_path(self.registry, root, path)?;
        for step in &resolved.joins {
            if ctx.aliases.contains_key(&step.path) {
                continue;
            }
            let (parent, name) = parent_path(&step.path);
            let parent_node = tree_root
                .find_mut(parent)
                .ok_or_else(|| Error::InvalidQuery(format!("no join available for '{path}'")))?;
            let parent_desc = Arc::clone(&parent_node.descriptor);
            let parent_alias = parent_node.alias.clone();
            let prop = parent_desc.property_any(name).ok_or_else(|| Error::UnknownProperty {
                bean: root.name().to_string(),
                path: path.to_string(),
            })?;

            let (target, outer, attach) = match &prop.kind {
                PropertyKind::One(one) => (
                    self.registry.get(&one.target)?,
                    parent_node.outer || one.nullable || !one.is_owning(),
                    Attach::One(one),
                ),
                PropertyKind::Many(many) => {
                    ctx.requires_distinct = true;
                    (self.registry.get(&many.target)?, parent_node.outer, Attach::Many(many))
                }
                _ => continue,
            };

            let alias = ctx.allocate(&step.path, target.table());
            let keyword = if outer { "left join" } else { "join" };
            let join = match attach {
                Attach::One(one) => one_join(keyword, target, &alias, &parent_alias, one, &parent_desc),
                Attach::Many(many) => {
                    if let Some(link) = &many.intersection {
                        ctx.tables.insert(link.table.to_ascii_lowercase());
                    }
                    many_join(keyword, target, &alias, &parent_alias, many, &parent_desc)
                }
            };
            debug!(path = %step.path, alias = %alias, "Added extra join for predicate");

            parent_node.children.push(SqlTreeNode {
                path: step.path.clone(),
                alias,
                descriptor: Arc::clone(target),
                kind: NodeKind::ExtraJoin { many: step.many },
                outer,
                discriminator: false,
                columns: Vec::new(),
                slots: Vec::new(),
                join: Some(join),
                formula_joins: Vec::new(),
                back_reference: None,
                children: Vec::new(),
            });
        }

        if let Terminal::Formula { join: Some(join), .. } = &resolved.terminal {
            if let Some(node) = tree_root.find_mut(&resolved.node_path) {
                add_formula_join(node, join);
            }
        }
        Ok(())
    }
}

fn add_formula_join(node: &mut SqlTreeNode, join: &str) {
    let join = with_alias(join, &node.alias);
    if !node.formula_joins.contains(&join) {
        node.formula_joins.push(join);
    }
}

fn one_join(
    keyword: &str,
    target: &BeanDescriptor,
    alias: &str,
    parent_alias: &str,
    one: &AssocOne,
    parent: &BeanDescriptor,
) -> String {
    let conditions: Vec<String> = if one.is_owning() {
        target
            .id_columns()
            .iter()
            .zip(&one.join_columns)
            .map(|(id, fk)| format!("{alias}.{id} = {parent_alias}.{fk}"))
            .collect()
    } else {
        one.join_columns
            .iter()
            .zip(parent.id_columns())
            .map(|(fk, id)| format!("{alias}.{fk} = {parent_alias}.{id}"))
            .collect()
    };
    format!("{keyword} {} {alias} on {}", target.table(), conditions.join(" and "))
}

fn many_join(
    keyword: &str,
    target: &BeanDescriptor,
    alias: &str,
    parent_alias: &str,
    many: &AssocMany,
    parent: &BeanDescriptor,
) -> String {
    match &many.intersection {
        Some(link) => {
            let link_alias = format!("{alias}z");
            let owner: Vec<String> = link
                .owner_columns
                .iter()
                .zip(parent.id_columns())
                .map(|(c, id)| format!("{link_alias}.{c} = {parent_alias}.{id}"))
                .collect();
            let target_cond: Vec<String> = target
                .id_columns()
                .iter()
                .zip(&link.target_columns)
                .map(|(id, c)| format!("{alias}.{id} = {link_alias}.{c}"))
                .collect();
            format!(
                "{keyword} {} {link_alias} on {} {keyword} {} {alias} on {}",
                link.table,
                owner.join(" and "),
                target.table(),
                target_cond.join(" and ")
            )
        }
        None => {
            let conditions: Vec<String> = many
                .join_columns
                .iter()
                .zip(parent.id_columns())
                .map(|(fk, id)| format!("{alias}.{fk} = {parent_alias}.{id}"))
                .collect();
            format!("{keyword} {} {alias} on {}", target.table(), conditions.join(" and "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LimitOffsetPlatform;
    use crate::test_support;
    use beanorm_proto::BeanQuery;

    fn build(query: &BeanQuery, paths: &[&str]) -> Result<SqlTree, Error> {
        let registry = test_support::registry();
        let root = registry.get(&query.bean_type)?.clone();
        let paths = paths.iter().map(|p| p.to_string()).collect();
        SqlTreeBuilder::new(&registry, &LimitOffsetPlatform).build(&root, query, &paths)
    }

    #[test]
    fn test_root_only_selects_foreign_keys() {
        let tree = build(&BeanQuery::new("Order"), &[]).unwrap();
        assert_eq!(tree.select_clause(false), "t0.id, t0.status, t0.customer_id");
        assert_eq!(tree.from_clause(), "o_order t0");
        assert!(tree.many_path().is_none());
    }

    #[test]
    fn test_fetched_one_replaces_foreign_key() {
        let tree = build(&BeanQuery::new("Order").fetch("customer"), &[]).unwrap();
        assert_eq!(
            tree.select_clause(false),
            "t0.id, t0.status, t1.id, t1.name, t1.email, t1.billing_line1, t1.billing_city, \
             (select count(*) from o_order x where x.customer_id = t1.id)"
        );
        assert_eq!(tree.from_clause(), "o_order t0 join o_customer t1 on t1.id = t0.customer_id");
    }

    #[test]
    fn test_many_fetch_is_outer_and_drops_back_reference() {
        let tree = build(&BeanQuery::new("Order").fetch("details"), &[]).unwrap();
        assert_eq!(
            tree.select_clause(false),
            "t0.id, t0.status, t0.customer_id, t1.id, t1.product_id, t1.qty"
        );
        assert_eq!(
            tree.from_clause(),
            "o_order t0 left join o_order_detail t1 on t1.order_id = t0.id"
        );
        assert_eq!(tree.many_path(), Some("details"));
        assert_eq!(tree.many_offset(), 3);
    }

    #[test]
    fn test_one_under_many_is_outer() {
        let tree = build(&BeanQuery::new("Order").fetch("details.product"), &[]).unwrap();
        assert!(tree
            .from_clause()
            .ends_with("left join o_product t2 on t2.id = t1.product_id"));
    }

    #[test]
    fn test_second_many_rejected() {
        let tree = build(&BeanQuery::new("Order").fetch("details").fetch("shipments"), &[]).unwrap();
        assert_eq!(tree.many_path(), Some("details"));
        assert!(!tree.from_clause().contains("o_shipment"));
    }

    #[test]
    fn test_nested_many_rejected() {
        let tree = build(&BeanQuery::new("Customer").fetch("orders.details"), &[]).unwrap();
        assert_eq!(tree.many_path(), Some("orders"));
        assert!(!tree.from_clause().contains("o_order_detail"));
    }

    #[test]
    fn test_many_to_many_join() {
        let tree = build(&BeanQuery::new("Order").fetch("tags"), &[]).unwrap();
        assert_eq!(
            tree.from_clause(),
            "o_order t0 left join o_order_tag t1z on t1z.order_id = t0.id \
             left join o_tag t1 on t1.id = t1z.tag_id"
        );
        assert!(tree.dependent_tables().contains("o_order_tag"));
    }

    #[test]
    fn test_partial_fetch() {
        let tree = build(
            &BeanQuery::new("Order").select(&["status"]).fetch_partial("customer", &["name"]),
            &[],
        )
        .unwrap();
        assert_eq!(tree.select_clause(false), "t0.id, t0.status, t1.id, t1.name");
    }

    #[test]
    fn test_unknown_include_fails_fast() {
        let err = build(&BeanQuery::new("Order").fetch("nope"), &[]).unwrap_err();
        assert!(err.is_config());
        let err = build(&BeanQuery::new("Order").fetch_partial("customer", &["nope"]), &[]).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_extra_join_for_predicate() {
        let tree = build(&BeanQuery::new("Order"), &["customer.name"]).unwrap();
        assert_eq!(tree.select_clause(false), "t0.id, t0.status, t0.customer_id");
        assert_eq!(tree.from_clause(), "o_order t0 join o_customer t1 on t1.id = t0.customer_id");
        assert_eq!(tree.alias_for("customer"), Some("t1"));
        assert!(!tree.requires_distinct());
    }

    #[test]
    fn test_extra_many_join_requires_distinct() {
        let tree = build(&BeanQuery::new("Order"), &["details.qty"]).unwrap();
        assert!(tree.requires_distinct());
        assert!(tree.many_path().is_none());

        // a fetched many needs no extra join
        let fetched = build(&BeanQuery::new("Order").fetch("details"), &["details.qty"]).unwrap();
        assert!(!fetched.requires_distinct());
    }

    #[test]
    fn test_foreign_key_predicate_needs_no_join() {
        let tree = build(&BeanQuery::new("Order"), &["customer.id"]).unwrap();
        assert_eq!(tree.from_clause(), "o_order t0");
    }

    #[test]
    fn test_inheritance_selects_discriminator_and_subtypes() {
        let tree = build(&BeanQuery::new("Animal"), &[]).unwrap();
        assert_eq!(tree.select_clause(false), "t0.dtype, t0.id, t0.name, t0.breed, t0.indoor");
    }

    #[test]
    fn test_formula_join_and_encrypted_column() {
        let tree = build(&BeanQuery::new("Supplier"), &[]).unwrap();
        assert_eq!(
            tree.select_clause(false),
            "t0.id, decrypt(t0.tax_number), t0_stats.total"
        );
        assert_eq!(
            tree.from_clause(),
            "o_supplier t0 left join supplier_stats t0_stats on t0_stats.supplier_id = t0.id"
        );
    }
}
