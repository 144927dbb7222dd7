//! Engine configuration.

use std::time::Duration;

/// Configuration for the query engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Statement timeout handed to the driver. None means no timeout.
    pub statement_timeout: Option<Duration>,

    /// Maximum number of cached query plans. None means unbounded.
    pub max_plans: Option<usize>,

    /// Record per-plan execution statistics.
    pub collect_statistics: bool,

    /// Default background fetch threshold for queries that do not set one.
    pub background_fetch_after: Option<usize>,

    /// Use the query-result cache unless a query opts out.
    pub default_query_cache: bool,

    /// Use the bean caches of types that enable them. Queries may still
    /// override this per query.
    pub default_bean_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            statement_timeout: None,
            max_plans: None,
            collect_statistics: true,
            background_fetch_after: None,
            default_query_cache: false,
            default_bean_cache: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Cap the number of cached plans.
    pub fn max_plans(mut self, max: usize) -> Self {
        self.max_plans = Some(max);
        self
    }

    /// Enable or disable statistics collection.
    pub fn collect_statistics(mut self, collect: bool) -> Self {
        self.collect_statistics = collect;
        self
    }

    /// Set the default background fetch threshold.
    pub fn background_fetch_after(mut self, after: usize) -> Self {
        self.background_fetch_after = Some(after);
        self
    }

    /// Use the query-result cache by default.
    pub fn default_query_cache(mut self, enabled: bool) -> Self {
        self.default_query_cache = enabled;
        self
    }

    /// Enable or disable bean caches by default.
    pub fn default_bean_cache(mut self, enabled: bool) -> Self {
        self.default_bean_cache = enabled;
        self
    }
}
