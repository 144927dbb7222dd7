//! Bean mapping descriptors.
//!
//! Descriptors are built once at startup by [`RegistryBuilder`] and are
//! immutable afterwards, so they are shared freely between threads.

mod descriptor;
mod inherit;
pub mod path;
mod property;
mod registry;

pub use descriptor::{BeanDescriptor, CacheOptions, IdentityStrategy};
pub use inherit::{InheritInfo, SubType};
pub use path::{resolve_include, resolve_path, JoinStep, ResolvedPath, Terminal};
pub use property::{
    with_alias, AssocMany, AssocOne, BeanProperty, BoolIntConverter, Cascade, CollectionKind,
    EmbeddedField, FormulaProperty, IntersectionTable, PropertyKind, ScalarConverter,
    ScalarProperty, ScalarType,
};
pub use registry::{DescriptorRegistry, RegistryBuilder};
