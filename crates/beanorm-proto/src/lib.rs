//! beanorm protocol types.
//!
//! This crate defines the values and query IR exchanged between callers and
//! the beanorm query engine.
//!
//! # Modules
//!
//! - [`value`] - Runtime values for bind parameters, columns and cached data
//! - [`query`] - Bean query IR (fetch paths, predicates, ordering, limits)
//! - [`expr`] - Predicate expression trees
//! - [`change`] - Table change events for cache invalidation
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! [`Value`] derives `rkyv` traits so cached snapshots can be stored as
//! bytes. Query IR types derive `serde` traits:
//!
//! ```ignore
//! use beanorm_proto::{BeanQuery, Expr};
//!
//! let query = BeanQuery::new("Order").fetch("customer").filter(Expr::eq("status", "NEW"));
//! let json = query.to_json()?;
//! ```

pub mod change;
pub mod error;
pub mod expr;
pub mod query;
pub mod value;

pub use change::TableChange;
pub use error::Error;
pub use expr::{CompareOp, Expr};
pub use query::{BeanQuery, CacheUse, FetchPath, OrderDirection, OrderSpec, RawClause};
pub use value::Value;
