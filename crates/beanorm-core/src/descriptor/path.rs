//! Property path resolution.
//!
//! A path such as `customer.billing.city` is resolved from a root descriptor
//! into the association joins it traverses and the terminal column (or
//! formula) it ends on.

use std::sync::Arc;

use super::descriptor::BeanDescriptor;
use super::property::{PropertyKind, ScalarConverter};
use super::registry::DescriptorRegistry;
use crate::error::Error;

/// One association traversed by a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    /// Association path from the root, e.g. `customer` or `details.product`.
    pub path: String,
    /// Whether the association is a to-many.
    pub many: bool,
}

/// What a path ends on.
#[derive(Debug, Clone)]
pub enum Terminal {
    /// A single column.
    Scalar {
        column: String,
        encrypted: bool,
        converter: Option<Arc<dyn ScalarConverter>>,
    },
    /// A formula expression with an optional secondary join.
    Formula { select: String, join: Option<String> },
    /// Foreign key or id columns of an association.
    Columns(Vec<String>),
}

/// A resolved property path.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Associations that must be joined, outermost first.
    pub joins: Vec<JoinStep>,
    /// Association path of the node owning the terminal ("" for the root).
    pub node_path: String,
    pub terminal: Terminal,
}

impl ResolvedPath {
    /// The first to-many traversed, if any.
    pub fn many(&self) -> Option<&JoinStep> {
        self.joins.iter().find(|j| j.many)
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Resolve a dot separated property path from `root`.
///
/// A path ending on the id of an owning to-one (`customer.id`) resolves to
/// the foreign key column without a join.
pub fn resolve_path(
    registry: &DescriptorRegistry,
    root: &BeanDescriptor,
    path: &str,
) -> Result<ResolvedPath, Error> {
    let unknown = || Error::UnknownProperty {
        bean: root.name().to_string(),
        path: path.to_string(),
    };

    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(unknown());
    }

    let mut joins = Vec::new();
    let mut node_path = String::new();
    let mut current: &BeanDescriptor = root;

    let mut i = 0;
    loop {
        let segment = segments[i];
        let last = i + 1 == segments.len();
        let prop = current.property_any(segment).ok_or_else(unknown)?;

        match &prop.kind {
            PropertyKind::Scalar(scalar) => {
                if !last {
                    return Err(unknown());
                }
                return Ok(ResolvedPath {
                    joins,
                    node_path,
                    terminal: Terminal::Scalar {
                        column: scalar.column.clone(),
                        encrypted: scalar.encrypted,
                        converter: scalar.converter.clone(),
                    },
                });
            }
            PropertyKind::Formula(formula) => {
                if !last {
                    return Err(unknown());
                }
                return Ok(ResolvedPath {
                    joins,
                    node_path,
                    terminal: Terminal::Formula {
                        select: formula.select.clone(),
                        join: formula.join.clone(),
                    },
                });
            }
            PropertyKind::Embedded(fields) => {
                if i + 2 != segments.len() {
                    return Err(unknown());
                }
                let field = fields
                    .iter()
                    .find(|f| f.name == segments[i + 1])
                    .ok_or_else(unknown)?;
                return Ok(ResolvedPath {
                    joins,
                    node_path,
                    terminal: Terminal::Scalar {
                        column: field.column.clone(),
                        encrypted: false,
                        converter: None,
                    },
                });
            }
            PropertyKind::One(one) => {
                let target = registry.get(&one.target)?;
                if one.is_owning() {
                    if last {
                        return Ok(ResolvedPath {
                            joins,
                            node_path,
                            terminal: Terminal::Columns(one.join_columns.clone()),
                        });
                    }
                    // customer.id reads the foreign key without joining
                    if i + 2 == segments.len() {
                        if let Some(pos) = target
                            .id_properties()
                            .iter()
                            .position(|p| p.name == segments[i + 1])
                        {
                            return Ok(ResolvedPath {
                                joins,
                                node_path,
                                terminal: Terminal::Scalar {
                                    column: one.join_columns[pos].clone(),
                                    encrypted: false,
                                    converter: target.id_properties()[pos]
                                        .as_scalar()
                                        .and_then(|s| s.converter.clone()),
                                },
                            });
                        }
                    }
                }
                node_path = join_path(&node_path, segment);
                joins.push(JoinStep {
                    path: node_path.clone(),
                    many: false,
                });
                if last {
                    return Ok(ResolvedPath {
                        joins,
                        node_path,
                        terminal: Terminal::Columns(
                            target.id_columns().iter().map(|c| c.to_string()).collect(),
                        ),
                    });
                }
                current = target.as_ref();
            }
            PropertyKind::Many(many) => {
                if last {
                    return Err(Error::InvalidQuery(format!(
                        "path '{path}' ends on a collection"
                    )));
                }
                let target = registry.get(&many.target)?;
                node_path = join_path(&node_path, segment);
                joins.push(JoinStep {
                    path: node_path.clone(),
                    many: true,
                });
                current = target.as_ref();
            }
        }
        i += 1;
    }
}

/// Resolve an include path, which must traverse associations only.
///
/// Returns the descriptor at the end of the path and the joins traversed.
pub fn resolve_include<'a>(
    registry: &'a DescriptorRegistry,
    root: &BeanDescriptor,
    path: &str,
) -> Result<(&'a Arc<BeanDescriptor>, Vec<JoinStep>), Error> {
    let unknown = || Error::UnknownProperty {
        bean: root.name().to_string(),
        path: path.to_string(),
    };

    let mut current = registry.get(root.name())?;
    let mut steps = Vec::new();
    let mut prefix = String::new();
    for segment in path.split('.') {
        let prop = current.property(segment).ok_or_else(unknown)?;
        let (target, many) = match &prop.kind {
            PropertyKind::One(one) => (&one.target, false),
            PropertyKind::Many(m) => (&m.target, true),
            _ => return Err(unknown()),
        };
        prefix = join_path(&prefix, segment);
        steps.push(JoinStep {
            path: prefix.clone(),
            many,
        });
        current = registry.get(target)?;
    }
    Ok((current, steps))
}
