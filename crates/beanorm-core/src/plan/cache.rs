//! Query plan cache.
//!
//! Plans are keyed by [`PlanKey`] in a concurrent map so lookups never wait
//! for a plan being built or inserted on another shard. The cache grows
//! without bound unless a cap is configured; over the cap the least executed
//! plan is evicted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::key::PlanKey;
use super::query_plan::QueryPlan;
use super::statistics::StatisticsSnapshot;
use crate::error::Error;

/// Plan cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Concurrent cache of compiled plans.
#[derive(Debug, Default)]
pub struct QueryPlanCache {
    plans: DashMap<PlanKey, Arc<QueryPlan>>,
    max_plans: Option<usize>,
    stats: CacheStats,
}

impl QueryPlanCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding at most `max_plans` plans.
    pub fn with_capacity_limit(max_plans: Option<usize>) -> Self {
        Self {
            max_plans,
            ..Self::default()
        }
    }

    /// Return the cached plan for `key`, building and caching it on a miss.
    ///
    /// Two threads missing the same key may both build; the first insert
    /// wins and both get that plan.
    pub fn get_or_build<F>(&self, key: PlanKey, build: F) -> Result<Arc<QueryPlan>, Error>
    where
        F: FnOnce(PlanKey) -> Result<QueryPlan, Error>,
    {
        if let Some(plan) = self.plans.get(&key) {
            self.stats.record_hit();
            return Ok(Arc::clone(plan.value()));
        }
        self.stats.record_miss();

        let plan = Arc::new(build(key.clone())?);
        debug!(plan_id = %plan.plan_id(), bean = %key.bean_type(), "Plan cache miss");

        if let Some(max) = self.max_plans {
            if self.plans.len() >= max && !self.plans.contains_key(&key) {
                self.evict_least_used();
            }
        }
        let cached = self.plans.entry(key).or_insert(plan);
        Ok(Arc::clone(cached.value()))
    }

    /// Evict the plan with the fewest executions.
    fn evict_least_used(&self) {
        let evict_key = self
            .plans
            .iter()
            .min_by_key(|entry| entry.value().statistics().count())
            .map(|entry| entry.key().clone());

        if let Some(key) = evict_key {
            self.plans.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Statistics of every plan for a bean type.
    pub fn statistics(&self, bean_type: &str) -> Vec<StatisticsSnapshot> {
        let mut snapshots: Vec<StatisticsSnapshot> = self
            .plans
            .iter()
            .filter(|entry| entry.key().bean_type() == bean_type)
            .map(|entry| entry.value().statistics_snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        snapshots
    }

    /// Reset statistics of the plans of one bean type, or of all plans.
    /// Cached SQL and trees stay.
    pub fn reset_statistics(&self, bean_type: Option<&str>) {
        for entry in self.plans.iter() {
            if bean_type.map_or(true, |t| entry.key().bean_type() == t) {
                entry.value().statistics().reset();
            }
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Drop every plan.
    pub fn clear(&self) {
        self.plans.clear();
    }
}
