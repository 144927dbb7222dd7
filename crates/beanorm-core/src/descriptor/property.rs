//! Bean property mappings.
//!
//! Property kinds are a closed set; the tree builder, predicate compiler and
//! reader all match on [`PropertyKind`] exhaustively.

use std::fmt;
use std::sync::Arc;

use beanorm_proto::Value;

use crate::error::Error;

/// Logical scalar type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    Int32,
    Int64,
    Float64,
    Decimal,
    String,
    Bytes,
    Timestamp,
    Uuid,
}

/// Converts between the database wire value and the logical value of a
/// property (enums, dates, booleans stored as integers and so on).
pub trait ScalarConverter: fmt::Debug + Send + Sync {
    /// Convert a value read from a result set.
    fn read(&self, raw: Value) -> Result<Value, Error>;

    /// Convert a logical value for binding.
    fn bind(&self, value: &Value) -> Result<Value, Error>;
}

/// Stores booleans as `0`/`1` integers.
#[derive(Debug, Default)]
pub struct BoolIntConverter;

impl ScalarConverter for BoolIntConverter {
    fn read(&self, raw: Value) -> Result<Value, Error> {
        match raw {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => other
                .as_i64()
                .map(|i| Value::Bool(i != 0))
                .ok_or_else(|| Error::InvalidData(format!("expected 0/1 but read {other}"))),
        }
    }

    fn bind(&self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Int32(i32::from(*b))),
            other => Err(Error::InvalidData(format!("expected bool but got {other}"))),
        }
    }
}

/// A column backed scalar.
#[derive(Debug, Clone)]
pub struct ScalarProperty {
    pub column: String,
    pub scalar_type: ScalarType,
    pub nullable: bool,
    pub unique: bool,
    /// Selected through the platform decrypt expression.
    pub encrypted: bool,
    /// Optimistic lock version column.
    pub version: bool,
    /// Part of the bean identity.
    pub id: bool,
    pub converter: Option<Arc<dyn ScalarConverter>>,
}

/// A read-only property computed by an SQL expression.
///
/// `select` and `join` use `${ta}` as the table alias placeholder.
#[derive(Debug, Clone)]
pub struct FormulaProperty {
    pub select: String,
    pub join: Option<String>,
    pub scalar_type: ScalarType,
}

/// One column of an embedded value.
#[derive(Debug, Clone)]
pub struct EmbeddedField {
    pub name: String,
    pub column: String,
    pub scalar_type: ScalarType,
}

/// Cascade behaviour of an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade {
    pub save: bool,
    pub delete: bool,
}

/// A to-one association.
#[derive(Debug, Clone)]
pub struct AssocOne {
    /// Target bean type, resolved through the registry.
    pub target: String,
    /// Foreign key columns. On the owning side they live on this bean's
    /// table; on the inverse side they live on the target table.
    pub join_columns: Vec<String>,
    /// Inverse side: name of the target's to-one property that owns the key.
    pub mapped_by: Option<String>,
    pub nullable: bool,
    pub cascade: Cascade,
}

impl AssocOne {
    /// Whether the foreign key lives on this bean's table.
    pub fn is_owning(&self) -> bool {
        self.mapped_by.is_none()
    }
}

/// Collection kind of a to-many association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    List,
    Set,
    /// Map keyed by a property of the target bean.
    Map { key_property: String },
}

/// Link table of a many-to-many association.
#[derive(Debug, Clone)]
pub struct IntersectionTable {
    pub table: String,
    /// Columns referencing the owning bean's id.
    pub owner_columns: Vec<String>,
    /// Columns referencing the target bean's id.
    pub target_columns: Vec<String>,
}

/// A to-many association.
#[derive(Debug, Clone)]
pub struct AssocMany {
    pub target: String,
    pub kind: CollectionKind,
    /// Target's to-one property holding the foreign key back to this bean.
    /// Inferred at registry build when not declared.
    pub mapped_by: Option<String>,
    /// Foreign key columns on the target table. Filled in at registry build.
    pub join_columns: Vec<String>,
    pub many_to_many: bool,
    pub intersection: Option<IntersectionTable>,
    /// Default fetch order, a property path relative to the target.
    pub order_by: Option<String>,
    pub cascade: Cascade,
}

/// The kind of a bean property.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    Scalar(ScalarProperty),
    Formula(FormulaProperty),
    Embedded(Vec<EmbeddedField>),
    One(AssocOne),
    Many(AssocMany),
}

/// A mapped attribute of a bean type.
#[derive(Debug, Clone)]
pub struct BeanProperty {
    pub name: String,
    pub kind: PropertyKind,
}

impl BeanProperty {
    /// Create a scalar property.
    pub fn scalar(name: impl Into<String>, column: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Scalar(ScalarProperty {
                column: column.into(),
                scalar_type,
                nullable: true,
                unique: false,
                encrypted: false,
                version: false,
                id: false,
                converter: None,
            }),
        }
    }

    /// Create an id property.
    pub fn id(name: impl Into<String>, column: impl Into<String>, scalar_type: ScalarType) -> Self {
        let mut prop = Self::scalar(name, column, scalar_type);
        if let PropertyKind::Scalar(s) = &mut prop.kind {
            s.id = true;
            s.nullable = false;
            s.unique = true;
        }
        prop
    }

    /// Create a formula property.
    pub fn formula(name: impl Into<String>, select: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Formula(FormulaProperty {
                select: select.into(),
                join: None,
                scalar_type,
            }),
        }
    }

    /// Create an embedded property from `(field, column, type)` triples.
    pub fn embedded(name: impl Into<String>, fields: &[(&str, &str, ScalarType)]) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Embedded(
                fields
                    .iter()
                    .map(|(name, column, scalar_type)| EmbeddedField {
                        name: name.to_string(),
                        column: column.to_string(),
                        scalar_type: *scalar_type,
                    })
                    .collect(),
            ),
        }
    }

    /// Create an owning to-one association.
    pub fn one(name: impl Into<String>, target: impl Into<String>, join_columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::One(AssocOne {
                target: target.into(),
                join_columns: join_columns.iter().map(|c| c.to_string()).collect(),
                mapped_by: None,
                nullable: true,
                cascade: Cascade::default(),
            }),
        }
    }

    /// Create the inverse side of a one-to-one association.
    pub fn one_mapped_by(name: impl Into<String>, target: impl Into<String>, mapped_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::One(AssocOne {
                target: target.into(),
                join_columns: Vec::new(),
                mapped_by: Some(mapped_by.into()),
                nullable: true,
                cascade: Cascade::default(),
            }),
        }
    }

    /// Create a one-to-many association.
    pub fn many(name: impl Into<String>, target: impl Into<String>, kind: CollectionKind) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Many(AssocMany {
                target: target.into(),
                kind,
                mapped_by: None,
                join_columns: Vec::new(),
                many_to_many: false,
                intersection: None,
                order_by: None,
                cascade: Cascade::default(),
            }),
        }
    }

    /// Create a many-to-many association. The link table is set with
    /// [`BeanProperty::with_intersection`].
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>, kind: CollectionKind) -> Self {
        let mut prop = Self::many(name, target, kind);
        if let PropertyKind::Many(m) = &mut prop.kind {
            m.many_to_many = true;
        }
        prop
    }

    /// Set nullability of a scalar or to-one property.
    pub fn nullable(mut self, nullable: bool) -> Self {
        match &mut self.kind {
            PropertyKind::Scalar(s) => s.nullable = nullable,
            PropertyKind::One(o) => o.nullable = nullable,
            _ => {}
        }
        self
    }

    /// Mark a scalar unique.
    pub fn unique(mut self) -> Self {
        if let PropertyKind::Scalar(s) = &mut self.kind {
            s.unique = true;
        }
        self
    }

    /// Mark a scalar as encrypted.
    pub fn encrypted(mut self) -> Self {
        if let PropertyKind::Scalar(s) = &mut self.kind {
            s.encrypted = true;
        }
        self
    }

    /// Mark a scalar as the version column.
    pub fn version(mut self) -> Self {
        if let PropertyKind::Scalar(s) = &mut self.kind {
            s.version = true;
        }
        self
    }

    /// Attach a scalar converter.
    pub fn with_converter(mut self, converter: Arc<dyn ScalarConverter>) -> Self {
        if let PropertyKind::Scalar(s) = &mut self.kind {
            s.converter = Some(converter);
        }
        self
    }

    /// Set the secondary join of a formula property.
    pub fn with_formula_join(mut self, join: impl Into<String>) -> Self {
        if let PropertyKind::Formula(f) = &mut self.kind {
            f.join = Some(join.into());
        }
        self
    }

    /// Declare the target property owning the foreign key of a to-many.
    pub fn mapped_by(mut self, property: impl Into<String>) -> Self {
        if let PropertyKind::Many(m) = &mut self.kind {
            m.mapped_by = Some(property.into());
        }
        self
    }

    /// Set the link table of a many-to-many.
    pub fn with_intersection(mut self, table: impl Into<String>, owner_columns: &[&str], target_columns: &[&str]) -> Self {
        if let PropertyKind::Many(m) = &mut self.kind {
            m.intersection = Some(IntersectionTable {
                table: table.into(),
                owner_columns: owner_columns.iter().map(|c| c.to_string()).collect(),
                target_columns: target_columns.iter().map(|c| c.to_string()).collect(),
            });
        }
        self
    }

    /// Set the default fetch order of a to-many.
    pub fn with_order_by(mut self, path: impl Into<String>) -> Self {
        if let PropertyKind::Many(m) = &mut self.kind {
            m.order_by = Some(path.into());
        }
        self
    }

    /// Cascade saves through this association.
    pub fn cascade_save(mut self) -> Self {
        if let Some(cascade) = self.cascade_mut() {
            cascade.save = true;
        }
        self
    }

    /// Cascade deletes through this association.
    pub fn cascade_delete(mut self) -> Self {
        if let Some(cascade) = self.cascade_mut() {
            cascade.delete = true;
        }
        self
    }

    fn cascade_mut(&mut self) -> Option<&mut Cascade> {
        match &mut self.kind {
            PropertyKind::One(o) => Some(&mut o.cascade),
            PropertyKind::Many(m) => Some(&mut m.cascade),
            _ => None,
        }
    }

    /// Cascade settings, for associations.
    pub fn cascade(&self) -> Option<Cascade> {
        match &self.kind {
            PropertyKind::One(o) => Some(o.cascade),
            PropertyKind::Many(m) => Some(m.cascade),
            _ => None,
        }
    }

    /// Whether this is an id property.
    pub fn is_id(&self) -> bool {
        matches!(&self.kind, PropertyKind::Scalar(s) if s.id)
    }

    /// Whether this is an association.
    pub fn is_assoc(&self) -> bool {
        matches!(self.kind, PropertyKind::One(_) | PropertyKind::Many(_))
    }

    /// Scalar mapping, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&ScalarProperty> {
        match &self.kind {
            PropertyKind::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// To-one mapping, if this is a to-one.
    pub fn as_one(&self) -> Option<&AssocOne> {
        match &self.kind {
            PropertyKind::One(o) => Some(o),
            _ => None,
        }
    }

    /// To-many mapping, if this is a to-many.
    pub fn as_many(&self) -> Option<&AssocMany> {
        match &self.kind {
            PropertyKind::Many(m) => Some(m),
            _ => None,
        }
    }
}

/// Replace the `${ta}` placeholder with a table alias.
pub fn with_alias(sql: &str, alias: &str) -> String {
    sql.replace("${ta}", alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_property() {
        let id = BeanProperty::id("id", "id", ScalarType::Int64);
        assert!(id.is_id());
        let s = id.as_scalar().unwrap();
        assert!(!s.nullable);
        assert!(s.unique);
    }

    #[test]
    fn test_builders_apply_to_matching_kind() {
        let one = BeanProperty::one("customer", "Customer", &["customer_id"])
            .nullable(false)
            .cascade_save();
        let assoc = one.as_one().unwrap();
        assert!(!assoc.nullable);
        assert!(assoc.is_owning());
        assert_eq!(one.cascade(), Some(Cascade { save: true, delete: false }));

        // encrypted on a non scalar is ignored
        let many = BeanProperty::many("details", "OrderDetail", CollectionKind::List).encrypted();
        assert!(many.as_many().is_some());
        assert!(many.as_scalar().is_none());
    }

    #[test]
    fn test_bool_int_converter() {
        let conv = BoolIntConverter;
        assert_eq!(conv.read(Value::Int32(1)).unwrap(), Value::Bool(true));
        assert_eq!(conv.read(Value::Int64(0)).unwrap(), Value::Bool(false));
        assert_eq!(conv.bind(&Value::Bool(true)).unwrap(), Value::Int32(1));
        assert!(conv.read(Value::String("x".into())).is_err());
    }

    #[test]
    fn test_with_alias() {
        assert_eq!(
            with_alias("(select count(*) from o_order o where o.customer_id = ${ta}.id)", "t1"),
            "(select count(*) from o_order o where o.customer_id = t1.id)"
        );
    }
}
