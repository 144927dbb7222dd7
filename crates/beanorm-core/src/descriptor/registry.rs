//! Descriptor registry.
//!
//! Associations refer to their targets by bean type name and are resolved
//! through the registry, so mutually referencing types (Order to Customer and
//! back) never embed each other.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::descriptor::BeanDescriptor;
use super::property::{AssocOne, PropertyKind};
use crate::error::Error;

/// Collects descriptors and builds an immutable [`DescriptorRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<BeanDescriptor>,
}

enum Resolution {
    OneColumns(Vec<String>),
    Many {
        mapped_by: String,
        join_columns: Vec<String>,
    },
}

impl RegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bean descriptor.
    pub fn register(mut self, descriptor: BeanDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Build the registry in two phases.
    ///
    /// Phase one orders and indexes each descriptor's own properties. Phase
    /// two resolves associations against the other descriptors, deriving
    /// one-to-many foreign keys from the target's to-one back reference.
    pub fn build(self) -> Result<DescriptorRegistry, Error> {
        let mut descriptors = self.descriptors;

        let mut positions = HashMap::new();
        for (i, desc) in descriptors.iter_mut().enumerate() {
            desc.init_properties().map_err(Error::Mapping)?;
            if desc.id_properties().is_empty() {
                return Err(Error::Mapping(format!("bean {} has no id property", desc.name())));
            }
            if positions.insert(desc.name().to_string(), i).is_some() {
                return Err(Error::Mapping(format!("bean {} registered twice", desc.name())));
            }
        }

        let mut resolutions = Vec::new();
        for (di, desc) in descriptors.iter().enumerate() {
            for (pi, prop) in desc.properties().iter().enumerate() {
                if let Some(resolution) = resolve_property(&descriptors, &positions, desc, &prop.name, &prop.kind)? {
                    resolutions.push((di, pi, resolution));
                }
            }
            if let Some(inherit) = desc.inheritance() {
                for sub in &inherit.subtypes {
                    for prop in &sub.properties {
                        match &prop.kind {
                            PropertyKind::Many(_) => {
                                return Err(Error::Mapping(format!(
                                    "subtype {} declares to-many '{}'; declare it on {}",
                                    sub.name,
                                    prop.name,
                                    desc.name()
                                )));
                            }
                            PropertyKind::One(one) if !one.is_owning() => {
                                return Err(Error::Mapping(format!(
                                    "subtype {} declares inverse to-one '{}'",
                                    sub.name, prop.name
                                )));
                            }
                            kind => {
                                resolve_property(&descriptors, &positions, desc, &prop.name, kind)?;
                            }
                        }
                    }
                }
            }
        }

        for (di, pi, resolution) in resolutions {
            let prop = descriptors[di].property_mut(pi);
            match (&mut prop.kind, resolution) {
                (PropertyKind::One(one), Resolution::OneColumns(columns)) => one.join_columns = columns,
                (PropertyKind::Many(many), Resolution::Many { mapped_by, join_columns }) => {
                    many.mapped_by = Some(mapped_by);
                    many.join_columns = join_columns;
                }
                _ => {}
            }
        }

        let mut registry = DescriptorRegistry::default();
        for desc in descriptors {
            registry
                .by_table
                .entry(desc.table().to_ascii_lowercase())
                .or_default()
                .push(desc.name().to_string());
            for (_, many) in desc.manys() {
                if let Some(link) = &many.intersection {
                    registry
                        .by_intersection
                        .entry(link.table.to_ascii_lowercase())
                        .or_default()
                        .push(desc.name().to_string());
                }
            }
            if let Some(inherit) = desc.inheritance() {
                for sub in &inherit.subtypes {
                    registry.subtypes.insert(sub.name.clone(), desc.name().to_string());
                }
            }
            registry.descriptors.insert(desc.name().to_string(), Arc::new(desc));
        }

        debug!(beans = registry.descriptors.len(), "Descriptor registry built");
        Ok(registry)
    }
}

fn lookup<'a>(
    descriptors: &'a [BeanDescriptor],
    positions: &HashMap<String, usize>,
    owner: &BeanDescriptor,
    property: &str,
    target: &str,
) -> Result<&'a BeanDescriptor, Error> {
    positions.get(target).map(|&i| &descriptors[i]).ok_or_else(|| {
        Error::Mapping(format!(
            "{}.{} targets unknown bean type {}",
            owner.name(),
            property,
            target
        ))
    })
}

/// Owning to-one properties on `target` that point back at `owner`.
fn back_references<'a>(target: &'a BeanDescriptor, owner: &str) -> Vec<(&'a str, &'a AssocOne)> {
    target
        .ones()
        .filter(|(_, one)| one.target == owner && one.is_owning())
        .map(|(prop, one)| (prop.name.as_str(), one))
        .collect()
}

fn resolve_property(
    descriptors: &[BeanDescriptor],
    positions: &HashMap<String, usize>,
    desc: &BeanDescriptor,
    name: &str,
    kind: &PropertyKind,
) -> Result<Option<Resolution>, Error> {
    match kind {
        PropertyKind::One(one) => {
            let target = lookup(descriptors, positions, desc, name, &one.target)?;
            match &one.mapped_by {
                None => {
                    if one.join_columns.len() != target.id_properties().len() {
                        return Err(Error::Mapping(format!(
                            "{}.{} has {} join columns but {} has {} id columns",
                            desc.name(),
                            name,
                            one.join_columns.len(),
                            target.name(),
                            target.id_properties().len()
                        )));
                    }
                    Ok(None)
                }
                Some(mapped_by) => {
                    let back = back_references(target, desc.name())
                        .into_iter()
                        .find(|(prop, _)| *prop == mapped_by.as_str())
                        .ok_or_else(|| {
                            Error::Mapping(format!(
                                "{}.{} is mapped by {}.{} which is not a to-one back to {}",
                                desc.name(),
                                name,
                                target.name(),
                                mapped_by,
                                desc.name()
                            ))
                        })?;
                    Ok(Some(Resolution::OneColumns(back.1.join_columns.clone())))
                }
            }
        }
        PropertyKind::Many(many) => {
            let target = lookup(descriptors, positions, desc, name, &many.target)?;
            if many.many_to_many {
                let link = many.intersection.as_ref().ok_or_else(|| {
                    Error::Mapping(format!(
                        "many-to-many {}.{} has no join table",
                        desc.name(),
                        name
                    ))
                })?;
                if link.owner_columns.len() != desc.id_properties().len()
                    || link.target_columns.len() != target.id_properties().len()
                {
                    return Err(Error::Mapping(format!(
                        "join table {} columns do not match the ids of {} and {}",
                        link.table,
                        desc.name(),
                        target.name()
                    )));
                }
                return Ok(None);
            }

            let candidates = back_references(target, desc.name());
            let (mapped_by, one) = match &many.mapped_by {
                Some(mapped_by) => candidates
                    .into_iter()
                    .find(|(prop, _)| *prop == mapped_by.as_str())
                    .ok_or_else(|| {
                        Error::Mapping(format!(
                            "{}.{} is mapped by {}.{} which is not a foreign key to {}",
                            desc.name(),
                            name,
                            target.name(),
                            mapped_by,
                            desc.name()
                        ))
                    })?,
                None => match candidates.len() {
                    0 => {
                        return Err(Error::Mapping(format!(
                            "no foreign key from {} to {} for {}.{}",
                            target.name(),
                            desc.name(),
                            desc.name(),
                            name
                        )))
                    }
                    1 => candidates[0],
                    _ => {
                        return Err(Error::Mapping(format!(
                            "ambiguous foreign key from {} to {} for {}.{}; set mapped_by",
                            target.name(),
                            desc.name(),
                            desc.name(),
                            name
                        )))
                    }
                },
            };
            Ok(Some(Resolution::Many {
                mapped_by: mapped_by.to_string(),
                join_columns: one.join_columns.clone(),
            }))
        }
        _ => Ok(None),
    }
}

/// Immutable registry of all bean descriptors.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<String, Arc<BeanDescriptor>>,
    /// Subtype name to hierarchy root name.
    subtypes: HashMap<String, String>,
    /// Lowercase base table name to bean types.
    by_table: HashMap<String, Vec<String>>,
    /// Lowercase intersection table name to owning bean types.
    by_intersection: HashMap<String, Vec<String>>,
}

impl DescriptorRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Get a descriptor by bean type. Subtype names resolve to the root of
    /// their hierarchy.
    pub fn get(&self, name: &str) -> Result<&Arc<BeanDescriptor>, Error> {
        self.find(name).ok_or_else(|| Error::UnknownBean(name.to_string()))
    }

    /// Find a descriptor by bean type.
    pub fn find(&self, name: &str) -> Option<&Arc<BeanDescriptor>> {
        self.descriptors.get(name).or_else(|| {
            self.subtypes
                .get(name)
                .and_then(|root| self.descriptors.get(root))
        })
    }

    /// Bean types whose base table is `table`.
    pub fn beans_for_table(&self, table: &str) -> &[String] {
        self.by_table
            .get(&table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Bean types owning a many-to-many through `table`.
    pub fn intersection_owners(&self, table: &str) -> &[String] {
        self.by_intersection
            .get(&table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterate over all descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BeanDescriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
