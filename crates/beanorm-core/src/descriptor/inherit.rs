//! Single-table inheritance.

use beanorm_proto::Value;

use super::property::BeanProperty;

/// A concrete subtype stored in the root table.
#[derive(Debug, Clone)]
pub struct SubType {
    /// Bean type name of the subtype.
    pub name: String,
    /// Discriminator value identifying rows of this subtype.
    pub discriminator: Value,
    /// Properties declared by the subtype itself.
    pub properties: Vec<BeanProperty>,
}

/// Inheritance information held by the root descriptor of a hierarchy.
#[derive(Debug, Clone)]
pub struct InheritInfo {
    /// Discriminator column on the root table.
    pub column: String,
    /// Discriminator value of rows that are plain root instances, if any.
    pub root_value: Option<Value>,
    pub subtypes: Vec<SubType>,
}

impl InheritInfo {
    /// Create inheritance info with a discriminator column.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            root_value: None,
            subtypes: Vec::new(),
        }
    }

    /// Set the discriminator value of root instances.
    pub fn with_root_value(mut self, value: impl Into<Value>) -> Self {
        self.root_value = Some(value.into());
        self
    }

    /// Add a subtype.
    pub fn with_subtype(
        mut self,
        name: impl Into<String>,
        discriminator: impl Into<Value>,
        properties: Vec<BeanProperty>,
    ) -> Self {
        self.subtypes.push(SubType {
            name: name.into(),
            discriminator: discriminator.into(),
            properties,
        });
        self
    }

    /// Find the subtype for a discriminator value.
    pub fn subtype_for(&self, discriminator: &Value) -> Option<&SubType> {
        self.subtypes.iter().find(|s| &s.discriminator == discriminator)
    }

    /// Find a subtype by name.
    pub fn subtype(&self, name: &str) -> Option<&SubType> {
        self.subtypes.iter().find(|s| s.name == name)
    }

    /// Find a subtype-local property by name, with the subtype declaring it.
    pub fn local_property(&self, name: &str) -> Option<(&SubType, &BeanProperty)> {
        self.subtypes
            .iter()
            .find_map(|s| s.properties.iter().find(|p| p.name == name).map(|p| (s, p)))
    }
}
