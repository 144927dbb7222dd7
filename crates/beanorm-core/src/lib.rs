//! beanorm core - query plans, query execution and the second-level cache.
//!
//! This crate turns [`proto::BeanQuery`] values into SQL over mapped bean types,
//! executes them on caller supplied connections and reads the rows back into
//! object graphs. Compiled plans and loaded beans are cached across queries.
//!
//! # Modules
//!
//! - [`descriptor`] - Bean type mappings and the registry resolving them
//! - [`sqltree`] - Join structure and select list of one query shape
//! - [`predicate`] - Where, having and order by compilation with binds
//! - [`plan`] - Compiled plans, the plan cache and execution statistics
//! - [`executor`] - Running a query and reading rows into beans
//! - [`cache`] - Bean, natural key, collection id and query result caches
//! - [`engine`] - The [`QueryEngine`] tying the above together
//!
//! ```ignore
//! use beanorm_core::{EngineConfig, LimitOffsetPlatform, QueryEngine};
//! use beanorm_core::proto::{BeanQuery, Expr};
//!
//! let engine = QueryEngine::new(registry, Arc::new(LimitOffsetPlatform), EngineConfig::default());
//! let orders = engine.find_list(&mut conn, BeanQuery::new("Order").fetch("details").filter(Expr::eq("status", "NEW")))?;
//! ```

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bean;
pub mod cache;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod executor;
pub mod plan;
pub mod platform;
pub mod predicate;
pub mod sqltree;

#[cfg(test)]
mod test_support;

pub use bean::{Bean, BeanId, BeanState, ManyCollection, PropertyValue};
pub use cache::{
    CacheCoordinator, CacheError, CacheRegion, CacheStore, CacheStoreFactory, MemoryStore,
    MemoryStoreFactory, TableChangeListener,
};
pub use config::EngineConfig;
pub use connection::{Connection, DbError, PreparedStatement, ResultSet};
pub use descriptor::{
    BeanDescriptor, BeanProperty, CacheOptions, CollectionKind, DescriptorRegistry, InheritInfo,
    RegistryBuilder, ScalarType,
};
pub use engine::QueryEngine;
pub use error::Error;
pub use executor::{BackgroundExecutor, BeanCollection, CancelHandle, QueryRequest, Task, ThreadExecutor};
pub use plan::{PlanKey, QueryPlan, QueryPlanCache, StatisticsSnapshot};
pub use platform::{DatabasePlatform, LimitOffsetPlatform, LimitedSql, RowNumberPlatform};

/// Re-export protocol types.
pub use beanorm_proto as proto;
