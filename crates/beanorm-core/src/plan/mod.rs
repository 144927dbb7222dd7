//! Query plans and the plan cache.

mod cache;
mod key;
mod query_plan;
mod statistics;

pub use cache::{CacheStats, QueryPlanCache};
pub use key::PlanKey;
pub use query_plan::QueryPlan;
pub use statistics::{PlanStatistics, StatisticsSnapshot, OVERFLOW_BUCKET};
