//! Integration tests for query execution and caching.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beanorm_core::proto::{BeanQuery, Expr, TableChange, Value};
use beanorm_core::{BeanId, DbError, EngineConfig, Error, TableChangeListener};
use parking_lot::Mutex;

use common::{engine, engine_with, order_line, product, MockConnection};

#[test]
fn test_same_shape_reuses_plan() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows(vec![]).with_rows(vec![]);

    engine
        .find_list(&mut conn, BeanQuery::new("Order").filter(Expr::eq("status", "NEW")))
        .unwrap();
    engine
        .find_list(&mut conn, BeanQuery::new("Order").filter(Expr::eq("status", "PAID")))
        .unwrap();

    assert_eq!(engine.plans().len(), 1);
    assert_eq!(conn.statement(0).sql, conn.statement(1).sql);
    assert_eq!(conn.statement(1).binds, vec![Value::from("PAID")]);
}

#[test]
fn test_master_detail_grouping() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows(vec![
        order_line(1, None),
        order_line(2, Some(20)),
        order_line(2, Some(21)),
        order_line(3, Some(30)),
    ]);

    let orders = engine
        .find_list(&mut conn, BeanQuery::new("Order").fetch("lines"))
        .unwrap();
    let sizes: Vec<usize> = orders
        .beans()
        .iter()
        .map(|o| o.many("lines").map_or(0, |l| l.len()))
        .collect();
    assert_eq!(sizes, vec![0, 2, 1]);
    assert_eq!(
        conn.statement(0).sql,
        "select t0.id, t0.status, t0.customer_id, t1.id, t1.qty from orders t0 \
         left join order_line t1 on t1.order_id = t0.id order by t0.id, t1.id"
    );
}

#[test]
fn test_interleaved_masters_fail() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows(vec![
        order_line(1, Some(10)),
        order_line(2, Some(20)),
        order_line(1, Some(11)),
    ]);

    let err = engine
        .find_list(&mut conn, BeanQuery::new("Order").fetch("lines"))
        .unwrap_err();
    assert!(matches!(err, Error::OrderingViolation { ref id, .. } if id == "1"));
    assert!(conn.statement(0).closed);
}

#[test]
fn test_max_rows_has_more() {
    let engine = engine();
    let mut conn = MockConnection::new()
        .with_rows((1..=6).map(product).collect())
        .with_rows((1..=5).map(product).collect());

    let more = engine
        .find_list(&mut conn, BeanQuery::new("Product").max_rows(5))
        .unwrap();
    assert_eq!(more.len(), 5);
    assert!(more.has_more_rows());

    let exact = engine
        .find_list(&mut conn, BeanQuery::new("Product").filter(Expr::like("sku", "SKU%")).max_rows(5))
        .unwrap();
    assert_eq!(exact.len(), 5);
    assert!(!exact.has_more_rows());
}

#[test]
fn test_read_only_beans_shared_from_cache() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows(vec![product(9)]);

    let loaded = engine
        .find_by_id(&mut conn, "Product", &BeanId::single(9i64))
        .unwrap()
        .unwrap();
    let a = engine.find_by_id(&mut conn, "Product", &BeanId::single(9i64)).unwrap().unwrap();
    let b = engine.find_by_id(&mut conn, "Product", &BeanId::single(9i64)).unwrap().unwrap();

    assert_eq!(conn.statement_count(), 1);
    assert_eq!(a.scalar("sku"), loaded.scalar("sku"));
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_insert_keeps_beans_update_drops_them() {
    let engine = engine();
    let mut conn = MockConnection::new()
        .with_rows(vec![vec![Value::Int64(1), Value::from("Ann"), Value::from("ann@example.com")]])
        .with_rows(vec![vec![Value::Int64(1), Value::from("Ann"), Value::from("ann@example.com")]]);
    let id = BeanId::single(1i64);

    engine.find_by_id(&mut conn, "Customer", &id).unwrap();
    engine.notify_table_change(&TableChange::insert("customer"));
    engine.find_by_id(&mut conn, "Customer", &id).unwrap();
    assert_eq!(conn.statement_count(), 1);

    engine.notify_table_change(&TableChange::update("CUSTOMER"));
    engine.find_by_id(&mut conn, "Customer", &id).unwrap();
    assert_eq!(conn.statement_count(), 2);
}

#[test]
fn test_query_cache_follows_table_changes() {
    let engine = engine();
    let mut conn = MockConnection::new()
        .with_rows(vec![product(1), product(2)])
        .with_rows(vec![product(1)]);
    let query = || BeanQuery::new("Product").filter(Expr::like("sku", "SKU-%"));

    assert_eq!(engine.find_list(&mut conn, query()).unwrap().len(), 2);
    assert_eq!(engine.find_list(&mut conn, query()).unwrap().len(), 2);
    assert_eq!(conn.statement_count(), 1);

    engine.notify_table_change(&TableChange::delete("product"));
    assert_eq!(engine.find_list(&mut conn, query()).unwrap().len(), 1);
    assert_eq!(conn.statement_count(), 2);
}

#[test]
fn test_predicate_on_many_adds_distinct() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows(vec![]);
    engine
        .find_list(&mut conn, BeanQuery::new("Order").filter(Expr::gt("lines.qty", 3)))
        .unwrap();
    let sql = conn.statement(0).sql.clone();
    assert!(sql.starts_with("select distinct t0.id, t0.status, t0.customer_id from orders t0"));
    assert!(sql.contains("t1.qty > ?"));
}

#[test]
fn test_cancel_during_read_is_quiet() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows((1..=4).map(product).collect());
    let request = engine.request(BeanQuery::new("Product"));
    let handle = request.cancel_handle();

    let mut seen = 0;
    let count = request
        .find_each(&mut conn, |_| {
            seen += 1;
            handle.cancel();
        })
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(seen, 1);
    let statement = conn.statement(0);
    assert!(statement.cancelled);
    assert!(statement.closed);
}

#[test]
fn test_background_fetch_on_thread() {
    let engine = engine_with(EngineConfig::default().background_fetch_after(10));
    let mut conn = MockConnection::new().with_rows((1..=100).map(product).collect());

    let list = engine
        .find_list(&mut conn, BeanQuery::new("Product"))
        .unwrap();
    assert!(list.len() >= 10);
    assert!(list.wait_finished_timeout(Duration::from_secs(10)));
    assert_eq!(list.len(), 100);
    assert!(conn.statement(0).closed);
}

#[test]
fn test_timeout_carries_sql_and_binds() {
    let engine = engine_with(EngineConfig::default().statement_timeout(Duration::from_millis(250)));
    let mut conn = MockConnection::new().with_error(DbError::Timeout);

    let err = engine
        .find_list(&mut conn, BeanQuery::new("Order").filter(Expr::eq("status", "NEW")))
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_config());
    let message = err.to_string();
    assert!(message.contains("from orders t0 where t0.status = ?"));
    assert!(message.contains("['NEW']"));
    assert_eq!(conn.statement(0).timeout, Some(Duration::from_millis(250)));
}

#[test]
fn test_unknown_include_fails_before_sql() {
    let engine = engine();
    let mut conn = MockConnection::new();
    let err = engine
        .find_list(&mut conn, BeanQuery::new("Order").fetch("nope"))
        .unwrap_err();
    assert!(err.is_config());
    assert_eq!(conn.statement_count(), 0);
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl TableChangeListener for Recorder {
    fn on_change(&self, change: &TableChange) {
        self.log.lock().push(format!("{}:{}", self.name, change.table));
    }
}

#[test]
fn test_listeners_notified_in_order() {
    let engine = engine();
    let log = Arc::new(Mutex::new(Vec::new()));
    let first: Arc<dyn TableChangeListener> = Arc::new(Recorder {
        name: "first",
        log: Arc::clone(&log),
    });
    let second: Arc<dyn TableChangeListener> = Arc::new(Recorder {
        name: "second",
        log: Arc::clone(&log),
    });
    engine.add_table_listener(Arc::clone(&first));
    engine.add_table_listener(Arc::clone(&second));

    engine.notify_table_change(&TableChange::insert("orders"));
    assert!(engine.remove_table_listener(&first));
    engine.notify_table_change(&TableChange::insert("product"));

    assert_eq!(
        *log.lock(),
        vec!["first:orders", "second:orders", "second:product"]
    );
}

#[test]
fn test_statistics_json() {
    let engine = engine();
    let mut conn = MockConnection::new().with_rows((1..=3).map(product).collect());
    engine
        .find_list(&mut conn, BeanQuery::new("Product"))
        .unwrap();

    let stats = engine.plan_statistics("Product");
    assert_eq!(stats.len(), 1);
    let json: serde_json::Value = serde_json::from_str(&stats[0].to_json().unwrap()).unwrap();
    assert_eq!(json["execution_count"], 1);
    assert_eq!(json["total_rows"], 3);
    assert_eq!(json["bean_type"], "Product");
}

#[test]
fn test_concurrent_queries_share_engine() {
    let engine = Arc::new(engine());
    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut conn = MockConnection::new().with_rows(vec![order_line(i, Some(i * 10))]);
                let orders = engine
                    .find_list(&mut conn, BeanQuery::new("Order").fetch("lines").filter(Expr::eq("status", "NEW")))
                    .unwrap();
                assert_eq!(orders.len(), 1);
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert_eq!(engine.plans().len(), 1);
}
