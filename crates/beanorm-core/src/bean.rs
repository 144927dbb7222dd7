//! Runtime bean instances.
//!
//! A [`Bean`] is a dynamically typed instance of a mapped type: a map from
//! property name to [`PropertyValue`]. Only the properties that were loaded
//! are present, so partially fetched beans carry fewer entries.

use std::collections::BTreeMap;
use std::fmt;

use beanorm_proto::Value;

use crate::descriptor::CollectionKind;

/// Identity value of a bean, one value per id property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BeanId(pub Vec<Value>);

impl BeanId {
    /// Single valued id.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Id values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Whether any part of the id is null.
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl fmt::Display for BeanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

impl From<Value> for BeanId {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

/// Lifecycle state of a bean instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeanState {
    /// Created by the application, not yet persisted.
    New,
    /// Loaded from the database or the cache.
    Loaded,
    /// Holds only its id; the rest loads lazily.
    Reference,
}

/// A loaded property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(Value),
    /// Embedded value; `None` when every column was null.
    Embedded(Option<BTreeMap<String, Value>>),
    One(Option<Box<Bean>>),
    Many(ManyCollection),
}

/// An instance of a mapped bean type.
#[derive(Debug, Clone, PartialEq)]
pub struct Bean {
    bean_type: String,
    id: Option<BeanId>,
    state: BeanState,
    values: BTreeMap<String, PropertyValue>,
}

impl Bean {
    /// Create a new, unpersisted bean.
    pub fn new(bean_type: impl Into<String>) -> Self {
        Self {
            bean_type: bean_type.into(),
            id: None,
            state: BeanState::New,
            values: BTreeMap::new(),
        }
    }

    /// Create a loaded bean with an id.
    pub fn loaded(bean_type: impl Into<String>, id: BeanId) -> Self {
        Self {
            bean_type: bean_type.into(),
            id: Some(id),
            state: BeanState::Loaded,
            values: BTreeMap::new(),
        }
    }

    /// Create a reference bean holding only its id.
    pub fn reference(bean_type: impl Into<String>, id: BeanId) -> Self {
        Self {
            bean_type: bean_type.into(),
            id: Some(id),
            state: BeanState::Reference,
            values: BTreeMap::new(),
        }
    }

    /// Concrete bean type name.
    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    pub fn id(&self) -> Option<&BeanId> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: BeanId) {
        self.id = Some(id);
    }

    pub fn state(&self) -> BeanState {
        self.state
    }

    pub fn is_reference(&self) -> bool {
        self.state == BeanState::Reference
    }

    /// Set the concrete type once the discriminator is known.
    pub(crate) fn set_bean_type(&mut self, bean_type: impl Into<String>) {
        self.bean_type = bean_type.into();
    }

    /// Get a loaded property.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Mutable access to a loaded property.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut PropertyValue> {
        self.values.get_mut(name)
    }

    /// Set a property value.
    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.values.insert(name.into(), value);
    }

    /// Set a scalar property.
    pub fn set_scalar(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.set(name, PropertyValue::Scalar(value.into()));
    }

    /// Builder form of [`Bean::set_scalar`].
    pub fn with_scalar(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_scalar(name, value);
        self
    }

    /// Get a scalar property value.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(PropertyValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Get an embedded field value.
    pub fn embedded(&self, name: &str, field: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(PropertyValue::Embedded(Some(fields))) => fields.get(field),
            _ => None,
        }
    }

    /// Get an associated bean.
    pub fn one(&self, name: &str) -> Option<&Bean> {
        match self.values.get(name) {
            Some(PropertyValue::One(Some(bean))) => Some(bean),
            _ => None,
        }
    }

    /// Get a loaded collection.
    pub fn many(&self, name: &str) -> Option<&ManyCollection> {
        match self.values.get(name) {
            Some(PropertyValue::Many(many)) => Some(many),
            _ => None,
        }
    }

    /// Mutable access to a loaded collection.
    pub fn many_mut(&mut self, name: &str) -> Option<&mut ManyCollection> {
        match self.values.get_mut(name) {
            Some(PropertyValue::Many(many)) => Some(many),
            _ => None,
        }
    }

    /// Whether a property is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Names of loaded properties.
    pub fn loaded_properties(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// A loaded to-many collection.
///
/// Once modify listening is on, additions and removals are recorded so the
/// persistence layer can apply them incrementally (intersection rows for
/// many-to-many).
#[derive(Debug, Clone, PartialEq)]
pub struct ManyCollection {
    kind: CollectionKind,
    elements: Vec<Bean>,
    modify_listening: bool,
    added: Vec<Bean>,
    removed: Vec<Bean>,
}

impl ManyCollection {
    /// Create an empty collection.
    pub fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            elements: Vec::new(),
            modify_listening: false,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.kind
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bean> {
        self.elements.iter()
    }

    fn contains_id(&self, id: Option<&BeanId>) -> bool {
        id.is_some() && self.elements.iter().any(|b| b.id() == id)
    }

    /// Append an element read from the database. Not tracked as a change.
    /// Sets ignore elements whose id is already present.
    pub fn push_loaded(&mut self, bean: Bean) {
        if self.kind == CollectionKind::Set && self.contains_id(bean.id()) {
            return;
        }
        self.elements.push(bean);
    }

    /// Add an element, recording the addition when listening.
    pub fn add(&mut self, bean: Bean) {
        if self.kind == CollectionKind::Set && self.contains_id(bean.id()) {
            return;
        }
        if self.modify_listening {
            self.added.push(bean.clone());
        }
        self.elements.push(bean);
    }

    /// Remove the element with the given id, recording the removal when
    /// listening.
    pub fn remove(&mut self, id: &BeanId) -> Option<Bean> {
        let pos = self.elements.iter().position(|b| b.id() == Some(id))?;
        let bean = self.elements.remove(pos);
        if self.modify_listening {
            self.removed.push(bean.clone());
        }
        Some(bean)
    }

    /// Turn modify listening on. Returns true only the first time.
    pub fn set_modify_listening(&mut self) -> bool {
        if self.modify_listening {
            return false;
        }
        self.modify_listening = true;
        true
    }

    pub fn is_modify_listening(&self) -> bool {
        self.modify_listening
    }

    /// Elements added since listening started.
    pub fn added(&self) -> &[Bean] {
        &self.added
    }

    /// Elements removed since listening started.
    pub fn removed(&self) -> &[Bean] {
        &self.removed
    }

    /// Look up a map element by its key property value.
    pub fn get_by_key(&self, key: &Value) -> Option<&Bean> {
        match &self.kind {
            CollectionKind::Map { key_property } => self
                .elements
                .iter()
                .rev()
                .find(|b| b.scalar(key_property) == Some(key)),
            _ => None,
        }
    }

    /// Ids of the elements in order.
    pub fn ids(&self) -> Vec<BeanId> {
        self.elements.iter().filter_map(|b| b.id().cloned()).collect()
    }
}
