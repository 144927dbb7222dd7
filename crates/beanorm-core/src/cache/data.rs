//! Cached snapshots and key encoding.
//!
//! Caches never hold live beans. A bean is reduced to a [`CachedBeanData`]
//! snapshot of its scalars, embedded values and to-one foreign keys, which
//! is serialized with rkyv and rebuilt into a fresh bean on every hit.

use std::collections::BTreeMap;

use beanorm_proto::Value;
use rkyv::{Archive, Deserialize, Serialize};

use crate::bean::{Bean, BeanId, PropertyValue};
use crate::descriptor::BeanDescriptor;
use crate::error::Error;

/// One embedded field value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CachedField {
    pub name: String,
    pub value: Value,
}

/// Cached form of one property.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum CachedValue {
    Scalar(Value),
    Embedded(Option<Vec<CachedField>>),
    /// Foreign key of a to-one; `None` when the association is null.
    Reference(Option<Vec<Value>>),
}

/// A named cached property.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CachedProperty {
    pub name: String,
    pub value: CachedValue,
}

/// Snapshot of a bean held by the bean cache.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CachedBeanData {
    /// Concrete bean type.
    pub bean_type: String,
    pub id: Vec<Value>,
    /// Loaded cacheable properties, in descriptor order.
    pub properties: Vec<CachedProperty>,
    /// Natural key value at the time of the snapshot.
    pub natural_key: Option<Value>,
}

impl CachedBeanData {
    /// Take a snapshot of a loaded bean.
    ///
    /// Only loaded properties are captured, so a partially loaded bean gives
    /// a partial snapshot. Formulas and to-many collections are never cached.
    pub fn from_bean(desc: &BeanDescriptor, bean: &Bean) -> Result<Self, Error> {
        let id = bean
            .id()
            .ok_or_else(|| Error::InvalidData(format!("cannot cache {} without id", bean.bean_type())))?;

        let mut properties = Vec::new();
        for prop in desc.properties_for(bean.bean_type()) {
            if !desc.is_cacheable_property(prop) {
                continue;
            }
            let value = match bean.get(&prop.name) {
                Some(PropertyValue::Scalar(v)) => CachedValue::Scalar(v.clone()),
                Some(PropertyValue::Embedded(fields)) => CachedValue::Embedded(fields.as_ref().map(|f| {
                    f.iter()
                        .map(|(name, value)| CachedField {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect()
                })),
                Some(PropertyValue::One(one)) => {
                    CachedValue::Reference(one.as_ref().and_then(|b| b.id()).map(|id| id.0.clone()))
                }
                Some(PropertyValue::Many(_)) | None => continue,
            };
            properties.push(CachedProperty {
                name: prop.name.clone(),
                value,
            });
        }

        let natural_key = desc
            .cache_options()
            .natural_key
            .as_deref()
            .and_then(|nk| bean.scalar(nk))
            .filter(|v| !v.is_null())
            .cloned();

        Ok(Self {
            bean_type: bean.bean_type().to_string(),
            id: id.0.clone(),
            properties,
            natural_key,
        })
    }

    /// Rebuild a fresh bean. To-ones come back as reference beans.
    pub fn to_bean(&self, desc: &BeanDescriptor) -> Bean {
        let mut bean = Bean::loaded(self.bean_type.clone(), BeanId(self.id.clone()));
        for prop in &self.properties {
            let value = match &prop.value {
                CachedValue::Scalar(v) => PropertyValue::Scalar(v.clone()),
                CachedValue::Embedded(fields) => PropertyValue::Embedded(fields.as_ref().map(|f| {
                    f.iter()
                        .map(|field| (field.name.clone(), field.value.clone()))
                        .collect::<BTreeMap<_, _>>()
                })),
                CachedValue::Reference(None) => PropertyValue::One(None),
                CachedValue::Reference(Some(id)) => {
                    let Some(target) = desc.property_any(&prop.name).and_then(|p| p.as_one()) else {
                        continue;
                    };
                    PropertyValue::One(Some(Box::new(Bean::reference(
                        target.target.clone(),
                        BeanId(id.clone()),
                    ))))
                }
            };
            bean.set(prop.name.clone(), value);
        }
        bean
    }

    /// Merge the properties of `changes` over this snapshot.
    ///
    /// Properties absent from `changes` keep their prior value, so a partial
    /// update never drops cached state it did not touch. The natural key
    /// follows the merged natural key property, so setting it to null
    /// clears it.
    pub fn merge(&self, desc: &BeanDescriptor, changes: &CachedBeanData) -> CachedBeanData {
        let mut merged = self.clone();
        for changed in &changes.properties {
            match merged.properties.iter_mut().find(|p| p.name == changed.name) {
                Some(existing) => existing.value = changed.value.clone(),
                None => merged.properties.push(changed.clone()),
            }
        }
        if let Some(nk) = desc.cache_options().natural_key.as_deref() {
            if let Some(value) = merged.property(nk) {
                merged.natural_key = match value {
                    CachedValue::Scalar(v) if !v.is_null() => Some(v.clone()),
                    _ => None,
                };
            }
        }
        merged.bean_type = changes.bean_type.clone();
        merged
    }

    /// Names of the captured properties.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    /// Get a captured property value.
    pub fn property(&self, name: &str) -> Option<&CachedValue> {
        self.properties.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Serialize the snapshot to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a snapshot from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Cached ids of a to-many collection.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CachedManyIds {
    pub ids: Vec<Vec<Value>>,
}

impl CachedManyIds {
    pub fn new(ids: &[BeanId]) -> Self {
        Self {
            ids: ids.iter().map(|id| id.0.clone()).collect(),
        }
    }

    pub fn bean_ids(&self) -> Vec<BeanId> {
        self.ids.iter().cloned().map(BeanId).collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Cached result of a list query.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CachedQueryResult {
    pub beans: Vec<CachedBeanData>,
    pub has_more: bool,
}

impl CachedQueryResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_DECIMAL: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_TIMESTAMP: u8 = 7;
const TAG_UUID: u8 = 8;

fn encode_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Encode values as a store key.
///
/// Format per value: `[tag (1 byte)][payload]`, integers big-endian and
/// variable data length prefixed. Int32 and Int64 share one tag so an id
/// bound as either width finds the same entry.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 9);
    for value in values {
        match value {
            Value::Null => buf.push(TAG_NULL),
            Value::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            Value::Int32(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&i64::from(*i).to_be_bytes());
            }
            Value::Int64(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float64(f) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Decimal(d) => {
                buf.push(TAG_DECIMAL);
                encode_len_prefixed(&mut buf, d.as_bytes());
            }
            Value::String(s) => {
                buf.push(TAG_STRING);
                encode_len_prefixed(&mut buf, s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(TAG_BYTES);
                encode_len_prefixed(&mut buf, b);
            }
            Value::Timestamp(t) => {
                buf.push(TAG_TIMESTAMP);
                buf.extend_from_slice(&t.to_be_bytes());
            }
            Value::Uuid(u) => {
                buf.push(TAG_UUID);
                buf.extend_from_slice(u);
            }
        }
    }
    buf
}

/// Key of a cached to-many collection: owner id followed by property name.
pub fn many_ids_key(owner: &BeanId, property: &str) -> Vec<u8> {
    let mut key = encode_key(owner.values());
    encode_len_prefixed(&mut key, property.as_bytes());
    key
}

/// Key of a cached query result: the canonical plan key followed by the
/// bind values.
pub fn query_key(canonical: &str, binds: &[Value]) -> Vec<u8> {
    let mut key = Vec::new();
    encode_len_prefixed(&mut key, canonical.as_bytes());
    key.extend_from_slice(&encode_key(binds));
    key
}
