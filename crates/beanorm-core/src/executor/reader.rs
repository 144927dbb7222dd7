//! Row to bean reading.
//!
//! Without a join fetched to-many every row is one bean. With one, a master
//! spans consecutive rows sharing its id, and the reader groups them:
//!
//! ```text
//! AwaitingFirstRow -> AccumulatingDetail <-> EmittingMaster -> Exhausted
//! ```
//!
//! Rows must arrive grouped by master id. A master id seen again after the
//! reader moved past it is an ordering violation and fails the query.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::cancel::CancelHandle;
use crate::bean::{Bean, BeanId, PropertyValue};
use crate::connection::{DbError, ResultSet};
use crate::error::Error;
use crate::plan::QueryPlan;
use crate::sqltree::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    AwaitingFirstRow,
    AccumulatingDetail,
    EmittingMaster,
    Exhausted,
}

pub(crate) enum RowOutcome<T> {
    Row(T),
    End,
    Cancelled,
}

/// Run `f` on the current row under the cancel lock, advancing first when
/// `advance` is set.
pub(crate) fn read_row<T>(
    handle: &CancelHandle,
    advance: bool,
    f: impl FnOnce(&dyn ResultSet) -> Result<T, Error>,
) -> Result<RowOutcome<T>, Error> {
    let mut state = handle.lock();
    if state.cancelled {
        return Ok(RowOutcome::Cancelled);
    }
    let Some(rs) = state.result_set.as_mut() else {
        return Ok(RowOutcome::End);
    };
    if advance && !rs.next()? {
        return Ok(RowOutcome::End);
    }
    f(&**rs).map(RowOutcome::Row)
}

/// The join fetched to-many of a master/detail query.
#[derive(Debug)]
struct ManyInfo {
    property: String,
    many_to_many: bool,
    back_reference: Option<String>,
}

enum Step {
    Detail(Option<Bean>),
    Master(Bean, Option<Bean>),
    NullRoot,
}

/// Reads beans from the open result set of a [`CancelHandle`].
///
/// The reader owns the statement and result set through the handle and
/// closes them when dropped.
pub(crate) struct BeanReader {
    plan: Arc<QueryPlan>,
    handle: CancelHandle,
    bind_log: String,
    state: ReadState,
    /// Master being accumulated.
    pending: Option<Bean>,
    /// Row advanced by a has-more check but not loaded yet.
    row_ready: bool,
    seen: HashSet<BeanId>,
    many: Option<ManyInfo>,
}

impl BeanReader {
    pub(crate) fn new(plan: Arc<QueryPlan>, handle: CancelHandle, bind_log: String) -> Self {
        let many = plan.tree().many_node().and_then(|node| match node.kind() {
            NodeKind::Many {
                property,
                many_to_many,
                ..
            } => Some(ManyInfo {
                property: property.clone(),
                many_to_many: *many_to_many,
                back_reference: node.back_reference.clone(),
            }),
            _ => None,
        });
        Self {
            plan,
            handle,
            bind_log,
            state: ReadState::AwaitingFirstRow,
            pending: None,
            row_ready: false,
            seen: HashSet::new(),
            many,
        }
    }

    pub(crate) fn plan(&self) -> &Arc<QueryPlan> {
        &self.plan
    }

    pub(crate) fn bind_log(&self) -> &str {
        &self.bind_log
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ReadState {
        self.state
    }

    /// Whether masters span several rows.
    pub(crate) fn is_master_detail(&self) -> bool {
        self.many.is_some()
    }

    /// Next bean, or `None` when the rows are exhausted or the query was
    /// cancelled.
    pub(crate) fn next_bean(&mut self) -> Result<Option<Bean>, Error> {
        if self.state == ReadState::Exhausted {
            return Ok(None);
        }
        let result = if self.many.is_some() {
            self.next_master()
        } else {
            self.next_single()
        };
        result.or_else(|e| self.fail(e))
    }

    /// Whether another bean follows, without loading it.
    pub(crate) fn has_more(&mut self) -> Result<bool, Error> {
        if self.state == ReadState::Exhausted {
            return Ok(false);
        }
        if self.many.is_some() {
            return Ok(self.pending.is_some());
        }
        if self.row_ready {
            return Ok(true);
        }
        match read_row(&self.handle, true, |_| Ok(())) {
            Ok(RowOutcome::Row(())) => {
                self.row_ready = true;
                Ok(true)
            }
            Ok(RowOutcome::End) | Ok(RowOutcome::Cancelled) => {
                self.state = ReadState::Exhausted;
                Ok(false)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Skip `n` beans. Returns how many were skipped.
    pub(crate) fn skip(&mut self, n: usize) -> Result<usize, Error> {
        let mut skipped = 0;
        while skipped < n && self.next_bean()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    fn fail<T: Default>(&mut self, e: Error) -> Result<T, Error> {
        self.state = ReadState::Exhausted;
        self.pending = None;
        if matches!(e, Error::Database(DbError::Cancelled)) && self.handle.is_cancelled() {
            debug!(plan_id = %self.plan.plan_id(), "Read stopped by cancellation");
            return Ok(T::default());
        }
        Err(e.enrich(self.plan.sql(), &self.bind_log))
    }

    fn null_id(&self) -> Error {
        Error::InvalidData(format!(
            "null id for {} in row of: {}",
            self.plan.bean_type(),
            self.plan.sql()
        ))
    }

    fn next_single(&mut self) -> Result<Option<Bean>, Error> {
        let tree = self.plan.tree();
        match read_row(&self.handle, !self.row_ready, |rs| tree.load_root(rs))? {
            RowOutcome::Row((root, _)) => {
                self.row_ready = false;
                self.state = ReadState::EmittingMaster;
                root.map(Some).ok_or_else(|| self.null_id())
            }
            RowOutcome::End | RowOutcome::Cancelled => {
                self.state = ReadState::Exhausted;
                Ok(None)
            }
        }
    }

    fn next_master(&mut self) -> Result<Option<Bean>, Error> {
        loop {
            let current = self.pending.as_ref().and_then(|b| b.id().cloned());
            let tree = self.plan.tree();
            let outcome = read_row(&self.handle, true, |rs| {
                let id = tree.read_root_id(rs)?;
                if id.is_some() && id == current {
                    Ok(Step::Detail(tree.load_detail(rs)?))
                } else {
                    let (root, detail) = tree.load_root(rs)?;
                    Ok(root.map_or(Step::NullRoot, |root| Step::Master(root, detail)))
                }
            });

            match outcome? {
                RowOutcome::Row(Step::NullRoot) => return Err(self.null_id()),
                RowOutcome::Row(Step::Detail(detail)) => {
                    self.state = ReadState::AccumulatingDetail;
                    if let Some(mut master) = self.pending.take() {
                        self.add_detail(&mut master, detail);
                        self.pending = Some(master);
                    }
                }
                RowOutcome::Row(Step::Master(mut master, detail)) => {
                    let Some(id) = master.id().cloned() else {
                        return Err(self.null_id());
                    };
                    if !self.seen.insert(id.clone()) {
                        return Err(Error::OrderingViolation {
                            id: id.to_string(),
                            sql: self.plan.sql().to_string(),
                        });
                    }
                    self.add_detail(&mut master, detail);
                    match self.pending.replace(master) {
                        Some(previous) => {
                            self.state = ReadState::EmittingMaster;
                            return Ok(Some(self.finish(previous)));
                        }
                        None => self.state = ReadState::AccumulatingDetail,
                    }
                }
                RowOutcome::End => {
                    self.state = ReadState::Exhausted;
                    return Ok(self.pending.take().map(|m| self.finish(m)));
                }
                RowOutcome::Cancelled => {
                    self.state = ReadState::Exhausted;
                    self.pending = None;
                    return Ok(None);
                }
            }
        }
    }

    fn add_detail(&self, master: &mut Bean, detail: Option<Bean>) {
        let (Some(many), Some(mut detail)) = (&self.many, detail) else {
            return;
        };
        if let (Some(back), Some(id)) = (&many.back_reference, master.id()) {
            detail.set(
                back.clone(),
                PropertyValue::One(Some(Box::new(Bean::reference(master.bean_type(), id.clone())))),
            );
        }
        if let Some(collection) = master.many_mut(&many.property) {
            collection.push_loaded(detail);
        }
    }

    /// The master's collection is complete; many-to-many collections start
    /// tracking changes from here on.
    fn finish(&self, mut master: Bean) -> Bean {
        if let Some(many) = self.many.as_ref().filter(|m| m.many_to_many) {
            if let Some(collection) = master.many_mut(&many.property) {
                collection.set_modify_listening();
            }
        }
        master
    }
}

impl Drop for BeanReader {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::cancel::CancelHandle;
    use crate::platform::LimitOffsetPlatform;
    use crate::plan::PlanKey;
    use crate::test_support::{self, row, ScriptedResultSet, ScriptedStatement};
    use beanorm_proto::{BeanQuery, Value};

    fn reader(query: &BeanQuery, rows: Vec<Vec<Value>>) -> (BeanReader, CancelHandle) {
        let registry = test_support::registry();
        let plan = Arc::new(
            QueryPlan::compile(&registry, &LimitOffsetPlatform, query, PlanKey::from_query(query)).unwrap(),
        );
        let handle = CancelHandle::new();
        let (stmt, _) = ScriptedStatement::new(Vec::new());
        {
            let mut state = handle.lock();
            state.statement = Some(Box::new(stmt));
            state.result_set = Some(Box::new(ScriptedResultSet::new(rows)));
        }
        (BeanReader::new(plan, handle.clone(), "[]".into()), handle)
    }

    fn order_row(order: i64, detail: Option<i64>) -> Vec<Value> {
        let detail_cols = match detail {
            Some(d) => [Value::Int64(d), Value::Int64(3), Value::Int32(1)],
            None => [Value::Null, Value::Null, Value::Null],
        };
        let mut r = row(&[Value::Int64(order), Value::from("NEW"), Value::Int64(7)]);
        r.extend(detail_cols);
        r
    }

    #[test]
    fn test_groups_details_per_master() {
        let query = BeanQuery::new("Order").fetch("details");
        let (mut reader, _) = reader(
            &query,
            vec![
                order_row(1, None),
                order_row(2, Some(20)),
                order_row(2, Some(21)),
                order_row(3, Some(30)),
            ],
        );
        assert_eq!(reader.state(), ReadState::AwaitingFirstRow);

        let mut counts = Vec::new();
        while let Some(order) = reader.next_bean().unwrap() {
            counts.push(order.many("details").unwrap().len());
        }
        assert_eq!(counts, vec![0, 2, 1]);
        assert_eq!(reader.state(), ReadState::Exhausted);
    }

    #[test]
    fn test_detail_gets_back_reference() {
        let query = BeanQuery::new("Order").fetch("details");
        let (mut reader, _) = reader(&query, vec![order_row(2, Some(20))]);
        let order = reader.next_bean().unwrap().unwrap();
        let detail = order.many("details").unwrap().iter().next().unwrap();
        let back = detail.one("order").unwrap();
        assert!(back.is_reference());
        assert_eq!(back.id(), Some(&BeanId::single(2i64)));
    }

    #[test]
    fn test_reappearing_master_is_ordering_violation() {
        let query = BeanQuery::new("Order").fetch("details");
        let (mut reader, _) = reader(
            &query,
            vec![order_row(1, Some(10)), order_row(2, Some(20)), order_row(1, Some(11))],
        );
        assert!(reader.next_bean().unwrap().is_some());
        let err = reader.next_bean().unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { ref id, .. } if id == "1"));
        assert!(reader.next_bean().unwrap().is_none());
    }

    #[test]
    fn test_many_to_many_listens_once_complete() {
        let query = BeanQuery::new("Order").fetch("tags");
        let tag_row = |order: i64, tag: i64| {
            row(&[
                Value::Int64(order),
                Value::from("NEW"),
                Value::Int64(7),
                Value::Int64(tag),
                Value::from("t"),
            ])
        };
        let (mut reader, _) = reader(&query, vec![tag_row(1, 5), tag_row(1, 6)]);
        let order = reader.next_bean().unwrap().unwrap();
        let tags = order.many("tags").unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags.is_modify_listening());
    }

    #[test]
    fn test_has_more_does_not_consume() {
        let query = BeanQuery::new("Product");
        let rows = vec![
            row(&[Value::Int64(1), Value::from("a")]),
            row(&[Value::Int64(2), Value::from("b")]),
        ];
        let (mut reader, _) = reader(&query, rows);
        assert!(reader.has_more().unwrap());
        assert!(reader.has_more().unwrap());
        assert_eq!(reader.next_bean().unwrap().unwrap().id(), Some(&BeanId::single(1i64)));
        assert_eq!(reader.next_bean().unwrap().unwrap().id(), Some(&BeanId::single(2i64)));
        assert!(!reader.has_more().unwrap());
    }

    #[test]
    fn test_conversion_failure_carries_sql() {
        let query = BeanQuery::new("Animal");
        let rows = vec![row(&[
            Value::from("C"),
            Value::Int64(2),
            Value::from("Tom"),
            Value::Null,
            Value::from("x"),
        ])];
        let (mut reader, _) = reader(&query, rows);
        let sql = reader.plan().sql().to_string();

        let err = reader.next_bean().unwrap_err();
        match &err {
            Error::Execution { sql: failed, bind_log, source } => {
                assert_eq!(failed, &sql);
                assert_eq!(bind_log, "[]");
                assert!(matches!(**source, Error::InvalidData(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains(&sql));
        assert_eq!(reader.state(), ReadState::Exhausted);
    }

    #[test]
    fn test_cancel_stops_quietly() {
        let query = BeanQuery::new("Product");
        let rows = vec![
            row(&[Value::Int64(1), Value::from("a")]),
            row(&[Value::Int64(2), Value::from("b")]),
        ];
        let (mut reader, handle) = reader(&query, rows);
        assert!(reader.next_bean().unwrap().is_some());
        handle.cancel();
        assert!(reader.next_bean().unwrap().is_none());
    }

    #[test]
    fn test_drop_closes_resources() {
        let query = BeanQuery::new("Product");
        let (reader, handle) = reader(&query, Vec::new());
        drop(reader);
        let state = handle.lock();
        assert!(state.statement.is_none());
        assert!(state.result_set.is_none());
    }
}
