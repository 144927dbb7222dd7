//! SQL tree nodes and row reading.

use std::collections::BTreeMap;
use std::sync::Arc;

use beanorm_proto::Value;

use crate::bean::{Bean, BeanId, ManyCollection, PropertyValue};
use crate::connection::ResultSet;
use crate::descriptor::{BeanDescriptor, CollectionKind, ScalarConverter};
use crate::error::Error;

/// Role of a node in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// The queried bean type.
    Root,
    /// A join fetched to-one.
    One { property: String },
    /// The join fetched to-many (detail side of a master/detail query).
    Many {
        property: String,
        collection: CollectionKind,
        many_to_many: bool,
    },
    /// A join present only so predicates can reference it. Selects nothing.
    ExtraJoin { many: bool },
}

/// How the columns of one selected property are turned into a value.
#[derive(Debug, Clone)]
pub(crate) enum SlotKind {
    Scalar(Option<Arc<dyn ScalarConverter>>),
    Embedded(Vec<String>),
    /// Foreign key columns loaded as a reference bean.
    Reference(String),
}

/// A selected property and the number of columns it occupies.
#[derive(Debug, Clone)]
pub(crate) struct ReadSlot {
    pub property: String,
    pub kind: SlotKind,
    pub width: usize,
    /// Only assigned when the row's concrete type is this subtype.
    pub subtype: Option<String>,
}

/// A node of the SQL tree. Immutable once the tree is built.
#[derive(Debug)]
pub struct SqlTreeNode {
    pub(crate) path: String,
    pub(crate) alias: String,
    pub(crate) descriptor: Arc<BeanDescriptor>,
    pub(crate) kind: NodeKind,
    pub(crate) outer: bool,
    pub(crate) discriminator: bool,
    /// Column expressions selected by this node, in read order.
    pub(crate) columns: Vec<String>,
    pub(crate) slots: Vec<ReadSlot>,
    /// Join clause attaching this node to its parent.
    pub(crate) join: Option<String>,
    /// Secondary joins required by formulas on this node.
    pub(crate) formula_joins: Vec<String>,
    /// Property on this bean referencing its master, set as a reference
    /// instead of being selected.
    pub(crate) back_reference: Option<String>,
    pub(crate) children: Vec<SqlTreeNode>,
}

impl SqlTreeNode {
    /// Association path from the root ("" for the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn descriptor(&self) -> &Arc<BeanDescriptor> {
        &self.descriptor
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether the node is joined with outer join semantics.
    pub fn is_outer(&self) -> bool {
        self.outer
    }

    pub fn children(&self) -> &[SqlTreeNode] {
        &self.children
    }

    /// Selected column expressions of this node only.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Names of the selected non-id properties, in read order.
    pub fn selected_properties(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.property.as_str())
    }

    /// Number of columns read by this node and its subtree.
    pub fn width(&self) -> usize {
        self.columns.len() + self.children.iter().map(SqlTreeNode::width).sum::<usize>()
    }

    pub(crate) fn find_mut(&mut self, path: &str) -> Option<&mut SqlTreeNode> {
        if self.path == path {
            return Some(self);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_mut(path) {
                return Some(found);
            }
        }
        None
    }

    pub(crate) fn visit<'a>(&'a self, f: &mut impl FnMut(&'a SqlTreeNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Read the id of this node's bean from the row starting at `start`.
    /// Returns `None` when the id is null (no matching outer join row).
    pub(crate) fn read_id(&self, rs: &dyn ResultSet, start: usize) -> Result<Option<BeanId>, Error> {
        let mut col = start + usize::from(self.discriminator);
        let mut values = Vec::with_capacity(self.descriptor.id_properties().len());
        for prop in self.descriptor.id_properties() {
            let raw = rs.get(col)?;
            col += 1;
            if raw.is_null() {
                return Ok(None);
            }
            let converter = prop.as_scalar().and_then(|s| s.converter.as_ref());
            values.push(convert(converter, raw)?);
        }
        Ok(Some(BeanId(values)))
    }

    /// Load this node's bean and its join fetched children from the row.
    ///
    /// `col` is advanced past the whole subtree whether or not a bean was
    /// read. The detail bean of a to-many child is handed back through
    /// `detail` rather than added to the master, since the master's
    /// collection spans several rows.
    pub(crate) fn load(
        &self,
        rs: &dyn ResultSet,
        col: &mut usize,
        detail: &mut Option<Bean>,
    ) -> Result<Option<Bean>, Error> {
        let start = *col;
        let end = start + self.width();

        let Some(id) = self.read_id(rs, start)? else {
            *col = end;
            return Ok(None);
        };

        let concrete = if self.discriminator {
            self.concrete_type(rs.get(start)?)?
        } else {
            self.descriptor.name().to_string()
        };

        let mut bean = Bean::loaded(concrete.clone(), id.clone());
        for (prop, value) in self.descriptor.id_properties().iter().zip(id.0) {
            bean.set_scalar(prop.name.clone(), value);
        }
        *col = start + usize::from(self.discriminator) + self.descriptor.id_properties().len();

        for slot in &self.slots {
            let assign = slot.subtype.as_deref().map_or(true, |s| s == concrete);
            let value = read_slot(rs, *col, slot)?;
            *col += slot.width;
            if assign {
                bean.set(slot.property.clone(), value);
            }
        }

        for child in &self.children {
            match &child.kind {
                NodeKind::ExtraJoin { .. } | NodeKind::Root => {}
                NodeKind::One { property } => {
                    let mut ignored = None;
                    let one = child.load(rs, col, &mut ignored)?;
                    bean.set(property.clone(), PropertyValue::One(one.map(Box::new)));
                }
                NodeKind::Many {
                    property,
                    collection,
                    ..
                } => {
                    let mut ignored = None;
                    *detail = child.load(rs, col, &mut ignored)?;
                    bean.set(
                        property.clone(),
                        PropertyValue::Many(ManyCollection::new(collection.clone())),
                    );
                }
            }
        }

        debug_assert_eq!(*col, end);
        *col = end;
        Ok(Some(bean))
    }

    fn concrete_type(&self, discriminator: Value) -> Result<String, Error> {
        let Some(inherit) = self.descriptor.inheritance() else {
            return Ok(self.descriptor.name().to_string());
        };
        if let Some(sub) = inherit.subtype_for(&discriminator) {
            return Ok(sub.name.clone());
        }
        if discriminator.is_null() || inherit.root_value.as_ref() == Some(&discriminator) {
            return Ok(self.descriptor.name().to_string());
        }
        Err(Error::InvalidData(format!(
            "unknown discriminator {discriminator} for {}",
            self.descriptor.name()
        )))
    }
}

fn convert(converter: Option<&Arc<dyn ScalarConverter>>, raw: Value) -> Result<Value, Error> {
    match converter {
        Some(c) => c.read(raw),
        None => Ok(raw),
    }
}

fn read_slot(rs: &dyn ResultSet, col: usize, slot: &ReadSlot) -> Result<PropertyValue, Error> {
    match &slot.kind {
        SlotKind::Scalar(converter) => Ok(PropertyValue::Scalar(convert(converter.as_ref(), rs.get(col)?)?)),
        SlotKind::Embedded(fields) => {
            let mut values = BTreeMap::new();
            let mut all_null = true;
            for (i, field) in fields.iter().enumerate() {
                let value = rs.get(col + i)?;
                all_null &= value.is_null();
                values.insert(field.clone(), value);
            }
            Ok(PropertyValue::Embedded(if all_null { None } else { Some(values) }))
        }
        SlotKind::Reference(target) => {
            let mut values = Vec::with_capacity(slot.width);
            for i in 0..slot.width {
                values.push(rs.get(col + i)?);
            }
            if values.iter().all(Value::is_null) {
                Ok(PropertyValue::One(None))
            } else {
                Ok(PropertyValue::One(Some(Box::new(Bean::reference(target.clone(), BeanId(values))))))
            }
        }
    }
}
