//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use beanorm_core::proto::Value;
use beanorm_core::{
    BeanDescriptor, BeanProperty, CacheOptions, CollectionKind, Connection, DbError, DescriptorRegistry,
    EngineConfig, LimitOffsetPlatform, PreparedStatement, QueryEngine, ResultSet, ScalarType,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test output. Set `RUST_LOG=beanorm_core=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn id() -> BeanProperty {
    BeanProperty::id("id", "id", ScalarType::Int64)
}

/// A shop: customers place orders of products, orders carry line items.
pub fn shop_registry() -> DescriptorRegistry {
    DescriptorRegistry::builder()
        .register(
            BeanDescriptor::new("Customer", "customer")
                .with_property(id())
                .with_property(BeanProperty::scalar("name", "name", ScalarType::String))
                .with_property(BeanProperty::scalar("email", "email", ScalarType::String))
                .with_cache(CacheOptions::bean_cache().with_natural_key("email")),
        )
        .register(
            BeanDescriptor::new("Order", "orders")
                .with_property(id())
                .with_property(BeanProperty::scalar("status", "status", ScalarType::String))
                .with_property(BeanProperty::one("customer", "Customer", &["customer_id"]).nullable(false))
                .with_property(BeanProperty::many("lines", "OrderLine", CollectionKind::List).with_order_by("id")),
        )
        .register(
            BeanDescriptor::new("OrderLine", "order_line")
                .with_property(id())
                .with_property(BeanProperty::one("order", "Order", &["order_id"]))
                .with_property(BeanProperty::scalar("qty", "qty", ScalarType::Int32)),
        )
        .register(
            BeanDescriptor::new("Product", "product")
                .with_property(id())
                .with_property(BeanProperty::scalar("sku", "sku", ScalarType::String))
                .with_cache(CacheOptions::bean_cache().read_only().with_query_cache()),
        )
        .build()
        .unwrap()
}

pub fn engine() -> QueryEngine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> QueryEngine {
    init_tracing();
    QueryEngine::new(shop_registry(), Arc::new(LimitOffsetPlatform), config)
}

pub fn product(id: i64) -> Vec<Value> {
    vec![Value::Int64(id), Value::from(format!("SKU-{id}"))]
}

/// `orders.id, orders.status, orders.customer_id, order_line.id, order_line.qty`
pub fn order_line(order: i64, line: Option<i64>) -> Vec<Value> {
    let mut row = vec![Value::Int64(order), Value::from("NEW"), Value::Int64(1)];
    match line {
        Some(line) => row.extend([Value::Int64(line), Value::Int32(1)]),
        None => row.extend([Value::Null, Value::Null]),
    }
    row
}

#[derive(Debug, Default)]
pub struct StatementLog {
    pub sql: String,
    pub binds: Vec<Value>,
    pub timeout: Option<Duration>,
    pub cancelled: bool,
    pub closed: bool,
}

type Shared<T> = Arc<Mutex<T>>;

struct Rows {
    rows: Vec<Vec<Value>>,
    position: usize,
}

impl ResultSet for Rows {
    fn next(&mut self) -> Result<bool, DbError> {
        if self.position < self.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn get(&self, index: usize) -> Result<Value, DbError> {
        self.position
            .checked_sub(1)
            .and_then(|row| self.rows.get(row))
            .and_then(|row| row.get(index))
            .cloned()
            .ok_or_else(|| DbError::Sql(format!("no column {index}")))
    }

    fn close(&mut self) {}
}

struct Statement {
    response: Option<Result<Vec<Vec<Value>>, DbError>>,
    log: Shared<StatementLog>,
}

impl PreparedStatement for Statement {
    fn bind(&mut self, _position: usize, value: &Value) -> Result<(), DbError> {
        self.log.lock().binds.push(value.clone());
        Ok(())
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.log.lock().timeout = Some(timeout);
        Ok(())
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>, DbError> {
        match self.response.take() {
            Some(Ok(rows)) => Ok(Box::new(Rows { rows, position: 0 })),
            Some(Err(e)) => Err(e),
            None => Err(DbError::Closed),
        }
    }

    fn cancel(&mut self) {
        self.log.lock().cancelled = true;
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }
}

/// A connection replaying scripted responses, one per statement.
#[derive(Default)]
pub struct MockConnection {
    responses: VecDeque<Result<Vec<Vec<Value>>, DbError>>,
    statements: Vec<Shared<StatementLog>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        self.responses.push_back(Ok(rows));
        self
    }

    pub fn with_error(mut self, error: DbError) -> Self {
        self.responses.push_back(Err(error));
        self
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn statement(&self, index: usize) -> parking_lot::MutexGuard<'_, StatementLog> {
        self.statements[index].lock()
    }
}

impl Connection for MockConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        let log = Arc::new(Mutex::new(StatementLog {
            sql: sql.to_string(),
            ..Default::default()
        }));
        self.statements.push(Arc::clone(&log));
        let response = self
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(DbError::Sql("unexpected statement".into())));
        Ok(Box::new(Statement {
            response: Some(response),
            log,
        }))
    }

    fn batch_flush(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}
