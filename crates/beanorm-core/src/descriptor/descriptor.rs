//! Bean descriptors.

use std::collections::HashMap;

use super::inherit::InheritInfo;
use super::property::{AssocMany, AssocOne, BeanProperty, PropertyKind};

/// How identity values are produced on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStrategy {
    None,
    /// Values come from a database sequence.
    Sequence(String),
    /// Values are generated by an identity column.
    Identity,
    /// Values are assigned by the application.
    Assigned,
}

/// Second-level cache options of a bean type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Cache beans by id.
    pub bean_cache: bool,
    /// Cache query results.
    pub query_cache: bool,
    /// Property used as natural key for cache lookups.
    pub natural_key: Option<String>,
    /// Cached instances are never mutated by callers.
    pub read_only: bool,
}

impl CacheOptions {
    /// Bean caching enabled.
    pub fn bean_cache() -> Self {
        Self {
            bean_cache: true,
            ..Default::default()
        }
    }

    /// Enable the query-result cache.
    pub fn with_query_cache(mut self) -> Self {
        self.query_cache = true;
        self
    }

    /// Set the natural key property.
    pub fn with_natural_key(mut self, property: impl Into<String>) -> Self {
        self.natural_key = Some(property.into());
        self
    }

    /// Mark cached instances read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Mapping of one bean type.
///
/// Built through [`crate::descriptor::RegistryBuilder`]; once the registry is
/// built the descriptor is immutable and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct BeanDescriptor {
    name: String,
    table: String,
    identity: IdentityStrategy,
    /// Id properties first, then the rest in declaration order.
    properties: Vec<BeanProperty>,
    index: HashMap<String, usize>,
    id_count: usize,
    save_cascade: Vec<usize>,
    delete_cascade: Vec<usize>,
    inheritance: Option<InheritInfo>,
    cache: CacheOptions,
}

impl BeanDescriptor {
    /// Create a descriptor for a bean type mapped to a table.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            identity: IdentityStrategy::None,
            properties: Vec::new(),
            index: HashMap::new(),
            id_count: 0,
            save_cascade: Vec::new(),
            delete_cascade: Vec::new(),
            inheritance: None,
            cache: CacheOptions::default(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, property: BeanProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// Add multiple properties.
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = BeanProperty>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Set the identity strategy.
    pub fn with_identity(mut self, identity: IdentityStrategy) -> Self {
        self.identity = identity;
        self
    }

    /// Set cache options.
    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    /// Make this the root of a single-table hierarchy.
    pub fn with_inheritance(mut self, inheritance: InheritInfo) -> Self {
        self.inheritance = Some(inheritance);
        self
    }

    /// First initialization phase: order id properties first and index by name.
    pub(crate) fn init_properties(&mut self) -> Result<(), String> {
        let (ids, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.properties)
            .into_iter()
            .partition(BeanProperty::is_id);
        self.id_count = ids.len();
        self.properties = ids;
        self.properties.extend(rest);

        self.index.clear();
        for (i, prop) in self.properties.iter().enumerate() {
            if self.index.insert(prop.name.clone(), i).is_some() {
                return Err(format!("duplicate property '{}' on {}", prop.name, self.name));
            }
        }
        if let Some(inherit) = &self.inheritance {
            for sub in &inherit.subtypes {
                for prop in &sub.properties {
                    if self.index.contains_key(&prop.name) || prop.is_id() {
                        return Err(format!(
                            "subtype {} redeclares property '{}'",
                            sub.name, prop.name
                        ));
                    }
                }
            }
        }

        self.save_cascade.clear();
        self.delete_cascade.clear();
        for (i, prop) in self.properties.iter().enumerate() {
            if let Some(cascade) = prop.cascade() {
                if cascade.save {
                    self.save_cascade.push(i);
                }
                if cascade.delete {
                    self.delete_cascade.push(i);
                }
            }
        }
        Ok(())
    }

    /// Mutable access for the association resolution phase.
    pub(crate) fn property_mut(&mut self, index: usize) -> &mut BeanProperty {
        &mut self.properties[index]
    }

    /// Bean type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identity(&self) -> &IdentityStrategy {
        &self.identity
    }

    /// All properties, ids first then declaration order.
    pub fn properties(&self) -> &[BeanProperty] {
        &self.properties
    }

    /// Id properties.
    pub fn id_properties(&self) -> &[BeanProperty] {
        &self.properties[..self.id_count]
    }

    /// Id columns in id property order.
    pub fn id_columns(&self) -> Vec<&str> {
        self.id_properties()
            .iter()
            .filter_map(|p| p.as_scalar().map(|s| s.column.as_str()))
            .collect()
    }

    /// Look up a property declared on this type.
    pub fn property(&self, name: &str) -> Option<&BeanProperty> {
        self.index.get(name).map(|&i| &self.properties[i])
    }

    /// Look up a property on this type or any subtype.
    pub fn property_any(&self, name: &str) -> Option<&BeanProperty> {
        self.property(name).or_else(|| {
            self.inheritance
                .as_ref()
                .and_then(|i| i.local_property(name))
                .map(|(_, p)| p)
        })
    }

    /// Properties visible on a concrete type of this hierarchy.
    pub fn properties_for<'a>(&'a self, concrete: &'a str) -> impl Iterator<Item = &'a BeanProperty> + 'a {
        let local = self
            .inheritance
            .as_ref()
            .and_then(|i| i.subtype(concrete))
            .map(|s| s.properties.as_slice())
            .unwrap_or(&[]);
        self.properties.iter().chain(local.iter())
    }

    /// To-one associations in declaration order.
    pub fn ones(&self) -> impl Iterator<Item = (&BeanProperty, &AssocOne)> {
        self.properties.iter().filter_map(|p| p.as_one().map(|o| (p, o)))
    }

    /// To-many associations in declaration order.
    pub fn manys(&self) -> impl Iterator<Item = (&BeanProperty, &AssocMany)> {
        self.properties.iter().filter_map(|p| p.as_many().map(|m| (p, m)))
    }

    /// Properties cascading saves.
    pub fn save_cascade(&self) -> impl Iterator<Item = &BeanProperty> {
        self.save_cascade.iter().map(|&i| &self.properties[i])
    }

    /// Properties cascading deletes.
    pub fn delete_cascade(&self) -> impl Iterator<Item = &BeanProperty> {
        self.delete_cascade.iter().map(|&i| &self.properties[i])
    }

    pub fn inheritance(&self) -> Option<&InheritInfo> {
        self.inheritance.as_ref()
    }

    pub fn cache_options(&self) -> &CacheOptions {
        &self.cache
    }

    /// Whether cached instances may be shared between callers: read-only
    /// cache option and no relationships.
    pub fn is_sharable(&self) -> bool {
        self.cache.read_only && !self.properties.iter().any(BeanProperty::is_assoc)
    }

    /// Whether the property is held in a cached bean snapshot. To-ones are
    /// held as foreign key values only.
    pub fn is_cacheable_property(&self, prop: &BeanProperty) -> bool {
        match &prop.kind {
            PropertyKind::Scalar(_) | PropertyKind::Embedded(_) => true,
            PropertyKind::One(o) => o.is_owning(),
            PropertyKind::Formula(_) | PropertyKind::Many(_) => false,
        }
    }
}
