//! The query engine: long-lived state shared by every query.

use std::sync::Arc;

use beanorm_proto::{BeanQuery, Expr, TableChange, Value};
use tracing::{debug, info};

use crate::bean::{Bean, BeanId};
use crate::cache::{CacheCoordinator, CacheStoreFactory, ListenerChain, TableChangeListener};
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::descriptor::DescriptorRegistry;
use crate::error::Error;
use crate::executor::{BackgroundExecutor, BeanCollection, ExecutionContext, QueryRequest, ThreadExecutor};
use crate::plan::{QueryPlanCache, StatisticsSnapshot};
use crate::platform::DatabasePlatform;

/// Query engine.
///
/// Owns the descriptor registry, the plan cache, the second-level cache and
/// the table change listeners. Connections are supplied per query, so one
/// engine serves any number of threads.
pub struct QueryEngine {
    registry: Arc<DescriptorRegistry>,
    platform: Arc<dyn DatabasePlatform>,
    plans: QueryPlanCache,
    cache: CacheCoordinator,
    background: Arc<dyn BackgroundExecutor>,
    listeners: ListenerChain<dyn TableChangeListener>,
    config: EngineConfig,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("platform", &self.platform.name())
            .field("beans", &self.registry.len())
            .field("plans", &self.plans.len())
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish()
    }
}

impl QueryEngine {
    /// Create an engine with in-memory cache stores and thread backed
    /// background fetching.
    pub fn new(registry: DescriptorRegistry, platform: Arc<dyn DatabasePlatform>, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        info!(
            platform = platform.name(),
            beans = registry.len(),
            max_plans = ?config.max_plans,
            "Query engine created"
        );
        Self {
            plans: QueryPlanCache::with_capacity_limit(config.max_plans),
            cache: CacheCoordinator::new(Arc::clone(&registry)),
            registry,
            platform,
            background: Arc::new(ThreadExecutor),
            listeners: ListenerChain::new(),
            config,
        }
    }

    /// Use `factory` for cache stores. Drops anything cached so far.
    pub fn with_cache_factory(mut self, factory: Arc<dyn CacheStoreFactory>) -> Self {
        self.cache = CacheCoordinator::with_factory(Arc::clone(&self.registry), factory);
        self
    }

    /// Run background fetches on `executor`.
    pub fn with_background_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.background = executor;
        self
    }

    fn context(&self) -> ExecutionContext<'_> {
        ExecutionContext {
            registry: &self.registry,
            platform: self.platform.as_ref(),
            plans: &self.plans,
            cache: &self.cache,
            background: &self.background,
            config: &self.config,
        }
    }

    /// Prepare `query` for execution. Use this to get a cancel handle
    /// before running.
    pub fn request(&self, query: BeanQuery) -> QueryRequest<'_> {
        QueryRequest::new(self.context(), query)
    }

    pub fn find_list(&self, conn: &mut dyn Connection, query: BeanQuery) -> Result<BeanCollection, Error> {
        self.request(query).find_list(conn)
    }

    pub fn find_set(&self, conn: &mut dyn Connection, query: BeanQuery) -> Result<BeanCollection, Error> {
        self.request(query).find_set(conn)
    }

    pub fn find_map(
        &self,
        conn: &mut dyn Connection,
        query: BeanQuery,
        key_property: &str,
    ) -> Result<BeanCollection, Error> {
        self.request(query).find_map(conn, key_property)
    }

    pub fn find_unique(&self, conn: &mut dyn Connection, query: BeanQuery) -> Result<Option<Arc<Bean>>, Error> {
        self.request(query).find_unique(conn)
    }

    pub fn find_each(
        &self,
        conn: &mut dyn Connection,
        query: BeanQuery,
        listener: impl FnMut(Bean),
    ) -> Result<usize, Error> {
        self.request(query).find_each(conn, listener)
    }

    /// Find a bean by id, from the bean cache when the type is cached.
    pub fn find_by_id(
        &self,
        conn: &mut dyn Connection,
        bean_type: &str,
        id: &BeanId,
    ) -> Result<Option<Arc<Bean>>, Error> {
        let query = BeanQuery::new(bean_type).with_compound_id(id.values().to_vec());
        self.find_unique(conn, query)
    }

    /// Find a bean by its natural key. The natural key cache is consulted
    /// first; on a miss the bean is queried by the natural key property.
    pub fn find_by_natural_key(
        &self,
        conn: &mut dyn Connection,
        bean_type: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Arc<Bean>>, Error> {
        let desc = self.registry.get(bean_type)?;
        let Some(property) = desc.cache_options().natural_key.clone() else {
            return Err(Error::InvalidQuery(format!("{bean_type} has no natural key")));
        };
        let value = value.into();
        if let Some(bean) = self.cache.get_by_natural_key(desc, &value, false) {
            return Ok(Some(bean));
        }
        self.find_unique(conn, BeanQuery::new(bean_type).filter(Expr::eq(property, value)))
    }

    /// Apply a committed table change: invalidate cached data, then notify
    /// listeners in registration order.
    pub fn notify_table_change(&self, change: &TableChange) {
        self.cache.invalidate(change);
        self.listeners.notify(change);
    }

    pub fn add_table_listener(&self, listener: Arc<dyn TableChangeListener>) {
        self.listeners.add(listener);
    }

    /// Remove a listener added earlier. Returns whether it was registered.
    pub fn remove_table_listener(&self, listener: &Arc<dyn TableChangeListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Merge the loaded properties of a saved bean into its cached snapshot.
    pub fn cache_update(&self, bean: &Bean) -> Result<(), Error> {
        let desc = self.registry.get(bean.bean_type())?;
        self.cache.cache_update(desc, bean);
        Ok(())
    }

    /// Execution statistics of every cached plan of a bean type.
    pub fn plan_statistics(&self, bean_type: &str) -> Vec<StatisticsSnapshot> {
        self.plans.statistics(bean_type)
    }

    /// Reset plan statistics of one bean type, or of every plan.
    pub fn reset_statistics(&self, bean_type: Option<&str>) {
        debug!(bean = ?bean_type, "Resetting plan statistics");
        self.plans.reset_statistics(bean_type);
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn platform(&self) -> &dyn DatabasePlatform {
        self.platform.as_ref()
    }

    pub fn plans(&self) -> &QueryPlanCache {
        &self.plans
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LimitOffsetPlatform;
    use crate::test_support::{self, row, ScriptedConnection};

    fn engine() -> QueryEngine {
        QueryEngine::new(
            test_support::registry(),
            Arc::new(LimitOffsetPlatform),
            EngineConfig::default(),
        )
    }

    fn product_rows(ids: &[i64]) -> Vec<Vec<Value>> {
        ids.iter()
            .map(|&id| row(&[Value::Int64(id), Value::from(format!("p{id}"))]))
            .collect()
    }

    #[test]
    fn test_plan_is_reused_across_executions() {
        let engine = engine();
        let mut conn = ScriptedConnection::new();
        conn.respond(product_rows(&[1]));
        conn.respond(product_rows(&[2]));

        engine.find_list(&mut conn, BeanQuery::new("Product")).unwrap();
        engine.find_list(&mut conn, BeanQuery::new("Product")).unwrap();

        assert_eq!(engine.plans().len(), 1);
        assert_eq!(engine.plans().stats().hits(), 1);
        let stats = engine.plan_statistics("Product");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].execution_count, 2);
        assert_eq!(stats[0].total_rows, 2);

        engine.reset_statistics(Some("Product"));
        assert_eq!(engine.plan_statistics("Product")[0].execution_count, 0);
    }

    #[test]
    fn test_find_by_id_uses_bean_cache() {
        let engine = engine();
        let mut conn = ScriptedConnection::new();
        conn.respond(product_rows(&[4]));

        let first = engine.find_by_id(&mut conn, "Product", &BeanId::single(4i64)).unwrap();
        assert!(first.is_some());
        let second = engine.find_by_id(&mut conn, "Product", &BeanId::single(4i64)).unwrap();
        assert_eq!(second.and_then(|b| b.id().cloned()), Some(BeanId::single(4i64)));
        assert_eq!(conn.executed().len(), 1);
    }

    #[test]
    fn test_find_by_natural_key_falls_back_to_query() {
        let engine = engine();
        let mut conn = ScriptedConnection::new();
        conn.respond(vec![row(&[
            Value::Int64(1),
            Value::from("Ann"),
            Value::from("ann@example.com"),
            Value::from("1 Main St"),
            Value::from("Springfield"),
            Value::Int64(3),
        ])]);

        let found = engine
            .find_by_natural_key(&mut conn, "Customer", "ann@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(found.scalar("name"), Some(&Value::from("Ann")));
        assert_eq!(conn.binds()[0], vec![Value::from("ann@example.com")]);

        let cached = engine
            .find_by_natural_key(&mut conn, "Customer", "ann@example.com")
            .unwrap();
        assert!(cached.is_some());
        assert_eq!(conn.executed().len(), 1);
    }

    #[test]
    fn test_natural_key_required() {
        let engine = engine();
        let mut conn = ScriptedConnection::new();
        let err = engine.find_by_natural_key(&mut conn, "Tag", "x").unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_find_unique_rejects_many() {
        let engine = engine();
        let mut conn = ScriptedConnection::new();
        conn.respond(product_rows(&[1, 2]));
        let err = engine.find_unique(&mut conn, BeanQuery::new("Product")).unwrap_err();
        assert!(matches!(err, Error::NonUniqueResult { count: 2, .. }));
    }
}
