//! Query execution.
//!
//! A [`QueryRequest`] runs one query against a caller supplied connection:
//! cache lookups, plan lookup, binding, execution under the cancel lock,
//! reading and cache population. Errors below the executor are enriched
//! with the SQL and bind log; planning errors pass through untouched.

mod background;
mod cancel;
mod collection;
mod reader;

use std::sync::Arc;
use std::time::{Duration, Instant};

use beanorm_proto::BeanQuery;
use tracing::{debug, error, instrument};

pub use background::{BackgroundExecutor, Task, ThreadExecutor};
pub use cancel::CancelHandle;
pub use collection::BeanCollection;

use background::BackgroundFetch;
use reader::BeanReader;

use crate::bean::{Bean, BeanId};
use crate::cache::{query_key, CacheCoordinator, CachedBeanData, CachedQueryResult};
use crate::config::EngineConfig;
use crate::connection::{Connection, DbError, PreparedStatement, ResultSet};
use crate::descriptor::{BeanDescriptor, CollectionKind, DescriptorRegistry};
use crate::error::Error;
use crate::plan::{PlanKey, QueryPlan, QueryPlanCache};
use crate::platform::DatabasePlatform;
use crate::predicate::BindValues;

/// Shared engine state a query runs against.
#[derive(Clone, Copy)]
pub(crate) struct ExecutionContext<'a> {
    pub(crate) registry: &'a DescriptorRegistry,
    pub(crate) platform: &'a dyn DatabasePlatform,
    pub(crate) plans: &'a QueryPlanCache,
    pub(crate) cache: &'a CacheCoordinator,
    pub(crate) background: &'a Arc<dyn BackgroundExecutor>,
    pub(crate) config: &'a EngineConfig,
}

/// One query, ready to run.
///
/// Take a [`CancelHandle`] before running to cancel from another thread.
pub struct QueryRequest<'a> {
    ctx: ExecutionContext<'a>,
    query: BeanQuery,
    handle: CancelHandle,
}

/// Where read beans go.
enum Sink<'f> {
    Collection(BeanCollection),
    Each(&'f mut dyn FnMut(Bean)),
}

fn open_statement(
    conn: &mut dyn Connection,
    sql: &str,
    binds: &BindValues,
    timeout: Option<Duration>,
) -> Result<(Box<dyn PreparedStatement>, Box<dyn ResultSet>), DbError> {
    let mut stmt = conn.prepare(sql)?;
    let executed = (|| {
        if let Some(timeout) = timeout {
            stmt.set_query_timeout(timeout)?;
        }
        for (position, value) in binds.values.iter().enumerate() {
            stmt.bind(position, value)?;
        }
        stmt.execute_query()
    })();
    match executed {
        Ok(rs) => Ok((stmt, rs)),
        Err(e) => {
            stmt.close();
            Err(e)
        }
    }
}

impl<'a> QueryRequest<'a> {
    pub(crate) fn new(ctx: ExecutionContext<'a>, query: BeanQuery) -> Self {
        Self {
            ctx,
            query,
            handle: CancelHandle::new(),
        }
    }

    pub fn query(&self) -> &BeanQuery {
        &self.query
    }

    /// Handle that cancels this query.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Run as a list.
    pub fn find_list(self, conn: &mut dyn Connection) -> Result<BeanCollection, Error> {
        self.collect(conn, CollectionKind::List)
    }

    /// Run as a set, distinct by id.
    pub fn find_set(self, conn: &mut dyn Connection) -> Result<BeanCollection, Error> {
        self.collect(conn, CollectionKind::Set)
    }

    /// Run as a map keyed by `key_property` of each bean.
    pub fn find_map(self, conn: &mut dyn Connection, key_property: &str) -> Result<BeanCollection, Error> {
        let desc = self.ctx.registry.get(&self.query.bean_type)?;
        if desc.property_any(key_property).and_then(|p| p.as_scalar()).is_none() {
            return Err(Error::UnknownProperty {
                bean: desc.name().to_string(),
                path: key_property.to_string(),
            });
        }
        self.collect(
            conn,
            CollectionKind::Map {
                key_property: key_property.to_string(),
            },
        )
    }

    /// Run expecting at most one bean.
    pub fn find_unique(self, conn: &mut dyn Connection) -> Result<Option<Arc<Bean>>, Error> {
        let bean_type = self.query.bean_type.clone();
        let beans = self.collect(conn, CollectionKind::List)?;
        beans.wait_finished();
        match beans.len() {
            0 | 1 => Ok(beans.get(0)),
            count => Err(Error::NonUniqueResult { bean: bean_type, count }),
        }
    }

    /// Stream beans to `listener` without collecting them. Returns the
    /// number of beans read.
    pub fn find_each(self, conn: &mut dyn Connection, mut listener: impl FnMut(Bean)) -> Result<usize, Error> {
        let mut sink = Sink::Each(&mut listener);
        self.execute(conn, &mut sink)
    }

    fn collect(self, conn: &mut dyn Connection, kind: CollectionKind) -> Result<BeanCollection, Error> {
        let collection = BeanCollection::new(kind);
        let mut sink = Sink::Collection(collection.clone());
        self.execute(conn, &mut sink)?;
        Ok(collection)
    }

    fn uses_bean_cache(&self, desc: &BeanDescriptor) -> bool {
        self.query
            .cache
            .bean_cache
            .unwrap_or(self.ctx.config.default_bean_cache && desc.cache_options().bean_cache)
    }

    /// Query results are cached only for plain root queries: no fetches,
    /// partial select, raw SQL or id.
    fn uses_query_cache(&self, desc: &BeanDescriptor) -> bool {
        let q = &self.query;
        (q.cache.query_cache || self.ctx.config.default_query_cache || desc.cache_options().query_cache)
            && q.fetches.is_empty()
            && q.select.is_empty()
            && q.raw_sql.is_none()
            && q.id.is_none()
    }

    /// Find by id served from the bean cache.
    fn cached_by_id(&self, desc: &BeanDescriptor) -> Option<Arc<Bean>> {
        let q = &self.query;
        let id = q.id.as_ref()?;
        if !self.uses_bean_cache(desc)
            || !q.fetches.is_empty()
            || !q.select.is_empty()
            || q.has_predicates()
            || q.raw_sql.is_some()
        {
            return None;
        }
        self.ctx.cache.get(desc, &BeanId(id.clone()), q.cache.mutable)
    }

    #[instrument(skip_all, fields(bean = %self.query.bean_type))]
    fn execute(self, conn: &mut dyn Connection, sink: &mut Sink<'_>) -> Result<usize, Error> {
        let ctx = self.ctx;
        self.query.validate()?;
        let desc = Arc::clone(ctx.registry.get(&self.query.bean_type)?);

        if let Some(bean) = self.cached_by_id(&desc) {
            debug!(bean = %desc.name(), "Bean cache hit");
            return Ok(match sink {
                Sink::Collection(collection) => {
                    collection.push(bean);
                    collection.mark_finished();
                    1
                }
                Sink::Each(listener) => {
                    (*listener)(Bean::clone(&bean));
                    1
                }
            });
        }

        let query = &self.query;
        let plan = ctx.plans.get_or_build(PlanKey::from_query(query), |key| {
            QueryPlan::compile(ctx.registry, ctx.platform, query, key)
        })?;
        let binds = plan.bind_values(ctx.registry, ctx.platform, query)?;
        let bind_log = binds.log();

        let query_cache_key = match &*sink {
            Sink::Collection(_) if self.uses_query_cache(&desc) => {
                Some(query_key(&plan.key().canonical(), &binds.values))
            }
            _ => None,
        };
        if let (Some(key), Sink::Collection(collection)) = (&query_cache_key, &mut *sink) {
            if let Some(cached) = ctx.cache.get_query(&desc, key) {
                debug!(plan_id = %plan.plan_id(), beans = cached.beans.len(), "Query cache hit");
                for data in &cached.beans {
                    collection.push(Arc::new(data.to_bean(&desc)));
                }
                collection.set_has_more_rows(cached.has_more);
                collection.mark_finished();
                return Ok(cached.beans.len());
            }
        }

        conn.batch_flush()
            .map_err(|e| Error::from(e).enrich(plan.sql(), &bind_log))?;

        let started = Instant::now();
        {
            let mut state = self.handle.lock();
            if state.cancelled {
                debug!(plan_id = %plan.plan_id(), "Query cancelled before execution");
                drop(state);
                if let Sink::Collection(collection) = &*sink {
                    collection.mark_finished();
                }
                return Ok(0);
            }
            match open_statement(conn, plan.sql(), &binds, ctx.config.statement_timeout) {
                Ok((stmt, rs)) => {
                    state.statement = Some(stmt);
                    state.result_set = Some(rs);
                }
                Err(e) => {
                    drop(state);
                    self.handle.close();
                    let err = Error::from(e).enrich(plan.sql(), &bind_log);
                    error!(plan_id = %plan.plan_id(), sql = %plan.sql(), bind = %bind_log, error = %err, "Query execution failed");
                    return Err(err);
                }
            }
        }

        let mut reader = BeanReader::new(Arc::clone(&plan), self.handle.clone(), bind_log);
        debug!(
            plan_id = %plan.plan_id(),
            master_detail = reader.is_master_detail(),
            bind = %reader.bind_log(),
            "Query executed"
        );
        let result = self.read(&desc, &plan, &mut reader, sink, query_cache_key, started);
        if let Err(e) = &result {
            error!(plan_id = %plan.plan_id(), sql = %plan.sql(), bind = %reader.bind_log(), error = %e, "Query read failed");
        }
        let (count, handoff) = result?;
        if let Some(handoff) = handoff {
            let fetch = BackgroundFetch {
                reader,
                collection: handoff.collection,
                remaining: handoff.remaining,
                started,
                foreground_count: count,
                collect_statistics: ctx.config.collect_statistics,
            };
            ctx.background.execute(Box::new(move || fetch.run()));
        }
        Ok(count)
    }

    /// Read loop. Returns the number of beans read in the foreground and, when
    /// the background threshold was reached, the continuation to hand off.
    fn read(
        &self,
        desc: &BeanDescriptor,
        plan: &Arc<QueryPlan>,
        reader: &mut BeanReader,
        sink: &mut Sink<'_>,
        query_cache_key: Option<Vec<u8>>,
        started: Instant,
    ) -> Result<(usize, Option<BackgroundHandoff>), Error> {
        let ctx = self.ctx;
        let query = &self.query;
        if !plan.is_row_limited() && query.first_row > 0 {
            reader.skip(query.first_row)?;
        }

        let max_rows = query.max_rows;
        let background_after = match &*sink {
            Sink::Collection(_) => query.background_fetch_after.or(ctx.config.background_fetch_after),
            Sink::Each(_) => None,
        };

        let mut count = 0usize;
        let mut has_more = false;
        let mut read_beans = Vec::new();
        loop {
            if max_rows.is_some_and(|max| count >= max) {
                has_more = reader.has_more()?;
                break;
            }
            if let (Some(after), Sink::Collection(collection)) = (background_after, &mut *sink) {
                if count >= after {
                    debug!(plan_id = %plan.plan_id(), read = count, "Handing fetch to background");
                    return Ok((
                        count,
                        Some(BackgroundHandoff {
                            collection: collection.clone(),
                            remaining: max_rows.map(|max| max - count),
                        }),
                    ));
                }
            }
            let Some(bean) = reader.next_bean()? else {
                break;
            };
            count += 1;
            match &mut *sink {
                Sink::Collection(collection) => {
                    let bean = Arc::new(bean);
                    collection.push(Arc::clone(&bean));
                    read_beans.push(bean);
                }
                Sink::Each(listener) => (*listener)(bean),
            }
        }

        if ctx.config.collect_statistics {
            plan.statistics().record(started.elapsed(), count as u64);
        }

        if let Sink::Collection(collection) = &*sink {
            collection.set_has_more_rows(has_more);
            self.populate_caches(desc, plan, &read_beans, has_more, query_cache_key);
            collection.mark_finished();
        }
        Ok((count, None))
    }

    fn populate_caches(
        &self,
        desc: &BeanDescriptor,
        plan: &QueryPlan,
        beans: &[Arc<Bean>],
        has_more: bool,
        query_cache_key: Option<Vec<u8>>,
    ) {
        let cache = self.ctx.cache;
        if self.uses_bean_cache(desc) && self.query.select.is_empty() {
            let many = plan.tree().many_path();
            for bean in beans {
                cache.put(desc, bean);
                if let (Some(property), Some(id)) = (many, bean.id()) {
                    if let Some(collection) = bean.many(property) {
                        cache.put_many_ids(desc, id, property, &collection.ids());
                    }
                }
            }
        }

        if let Some(key) = query_cache_key {
            let snapshots: Result<Vec<_>, Error> =
                beans.iter().map(|b| CachedBeanData::from_bean(desc, b)).collect();
            match snapshots {
                Ok(beans) => cache.put_query(
                    desc,
                    key,
                    &CachedQueryResult { beans, has_more },
                    plan.dependent_tables(),
                ),
                Err(e) => debug!(plan_id = %plan.plan_id(), error = %e, "Query result not cached"),
            }
        }
    }
}

/// Where a fetch handed to the background continues.
struct BackgroundHandoff {
    collection: BeanCollection,
    remaining: Option<usize>,
}
