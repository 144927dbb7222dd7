//! Shared fixtures for unit tests: a small order domain and a scripted
//! connection that records what the engine sends it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use beanorm_proto::Value;
use parking_lot::Mutex;

use crate::connection::{Connection, DbError, PreparedStatement, ResultSet};
use crate::descriptor::{
    BeanDescriptor, BeanProperty, BoolIntConverter, CacheOptions, CollectionKind, DescriptorRegistry,
    InheritInfo, ScalarType,
};

fn id() -> BeanProperty {
    BeanProperty::id("id", "id", ScalarType::Int64)
}

/// Customer, Order, OrderDetail, Product, Tag, Shipment, an Animal
/// hierarchy and a Supplier with an encrypted column and a joined formula.
pub(crate) fn registry() -> DescriptorRegistry {
    DescriptorRegistry::builder()
        .register(
            BeanDescriptor::new("Customer", "o_customer")
                .with_property(id())
                .with_property(BeanProperty::scalar("name", "name", ScalarType::String))
                .with_property(BeanProperty::scalar("email", "email", ScalarType::String).unique())
                .with_property(BeanProperty::embedded(
                    "billing",
                    &[
                        ("line1", "billing_line1", ScalarType::String),
                        ("city", "billing_city", ScalarType::String),
                    ],
                ))
                .with_property(BeanProperty::formula(
                    "order_count",
                    "(select count(*) from o_order x where x.customer_id = ${ta}.id)",
                    ScalarType::Int64,
                ))
                .with_property(BeanProperty::many("orders", "Order", CollectionKind::List).mapped_by("customer"))
                .with_cache(CacheOptions::bean_cache().with_natural_key("email")),
        )
        .register(
            BeanDescriptor::new("Order", "o_order")
                .with_property(id())
                .with_property(BeanProperty::scalar("status", "status", ScalarType::String))
                .with_property(BeanProperty::one("customer", "Customer", &["customer_id"]).nullable(false))
                .with_property(
                    BeanProperty::many("details", "OrderDetail", CollectionKind::List)
                        .mapped_by("order")
                        .with_order_by("id"),
                )
                .with_property(
                    BeanProperty::many_to_many("tags", "Tag", CollectionKind::Set).with_intersection(
                        "o_order_tag",
                        &["order_id"],
                        &["tag_id"],
                    ),
                )
                .with_property(BeanProperty::many("shipments", "Shipment", CollectionKind::List))
                .with_cache(CacheOptions::bean_cache().with_query_cache()),
        )
        .register(
            BeanDescriptor::new("OrderDetail", "o_order_detail")
                .with_property(id())
                .with_property(BeanProperty::one("order", "Order", &["order_id"]))
                .with_property(BeanProperty::one("product", "Product", &["product_id"]))
                .with_property(BeanProperty::scalar("qty", "qty", ScalarType::Int32)),
        )
        .register(
            BeanDescriptor::new("Product", "o_product")
                .with_property(id())
                .with_property(BeanProperty::scalar("name", "name", ScalarType::String))
                .with_cache(CacheOptions::bean_cache().read_only()),
        )
        .register(
            BeanDescriptor::new("Tag", "o_tag")
                .with_property(id())
                .with_property(BeanProperty::scalar("name", "name", ScalarType::String)),
        )
        .register(
            BeanDescriptor::new("Shipment", "o_shipment")
                .with_property(id())
                .with_property(BeanProperty::one("order", "Order", &["order_id"]))
                .with_property(BeanProperty::scalar("carrier", "carrier", ScalarType::String)),
        )
        .register(
            BeanDescriptor::new("Animal", "animal")
                .with_property(id())
                .with_property(BeanProperty::scalar("name", "name", ScalarType::String))
                .with_inheritance(
                    InheritInfo::new("dtype")
                        .with_subtype(
                            "Dog",
                            "D",
                            vec![BeanProperty::scalar("breed", "breed", ScalarType::String)],
                        )
                        .with_subtype(
                            "Cat",
                            "C",
                            vec![BeanProperty::scalar("indoor", "indoor", ScalarType::Bool)
                                .with_converter(Arc::new(BoolIntConverter))],
                        ),
                ),
        )
        .register(
            BeanDescriptor::new("Supplier", "o_supplier")
                .with_property(id())
                .with_property(BeanProperty::scalar("tax_number", "tax_number", ScalarType::String).encrypted())
                .with_property(
                    BeanProperty::formula("total", "${ta}_stats.total", ScalarType::Decimal).with_formula_join(
                        "left join supplier_stats ${ta}_stats on ${ta}_stats.supplier_id = ${ta}.id",
                    ),
                ),
        )
        .build()
        .expect("fixture registry builds")
}

/// A result row.
pub(crate) fn row(values: &[Value]) -> Vec<Value> {
    values.to_vec()
}

/// Rows served from memory.
#[derive(Debug)]
pub(crate) struct ScriptedResultSet {
    rows: Vec<Vec<Value>>,
    /// Index of the current row plus one; 0 before the first row.
    position: usize,
    closed: bool,
}

impl ScriptedResultSet {
    pub(crate) fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows,
            position: 0,
            closed: false,
        }
    }

    /// Advance, for tests that drive the result set directly.
    pub(crate) fn next_row(&mut self) -> bool {
        ResultSet::next(self).unwrap_or(false)
    }
}

impl ResultSet for ScriptedResultSet {
    fn next(&mut self) -> Result<bool, DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        if self.position < self.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn get(&self, index: usize) -> Result<Value, DbError> {
        let row = self
            .position
            .checked_sub(1)
            .and_then(|i| self.rows.get(i))
            .ok_or_else(|| DbError::Sql("no current row".into()))?;
        row.get(index)
            .cloned()
            .ok_or_else(|| DbError::Sql(format!("column {index} out of range")))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
struct StatementFlags {
    binds: Vec<Value>,
    timeout: Option<Duration>,
    cancelled: bool,
    closed: bool,
}

/// What happened to a [`ScriptedStatement`] after it was handed over.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementState(Arc<Mutex<StatementFlags>>);

impl StatementState {
    pub(crate) fn binds(&self) -> Vec<Value> {
        self.0.lock().binds.clone()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.0.lock().timeout
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.0.lock().cancelled
    }

    pub(crate) fn closed(&self) -> bool {
        self.0.lock().closed
    }
}

/// A statement that returns scripted rows or fails on execute.
#[derive(Debug)]
pub(crate) struct ScriptedStatement {
    response: Option<Result<Vec<Vec<Value>>, DbError>>,
    state: StatementState,
}

impl ScriptedStatement {
    pub(crate) fn new(rows: Vec<Vec<Value>>) -> (Self, StatementState) {
        Self::with_response(Ok(rows))
    }

    pub(crate) fn with_response(response: Result<Vec<Vec<Value>>, DbError>) -> (Self, StatementState) {
        let state = StatementState::default();
        let stmt = Self {
            response: Some(response),
            state: state.clone(),
        };
        (stmt, state)
    }
}

impl PreparedStatement for ScriptedStatement {
    fn bind(&mut self, position: usize, value: &Value) -> Result<(), DbError> {
        let mut state = self.state.0.lock();
        if state.binds.len() != position {
            return Err(DbError::Sql(format!("bind position {position} out of order")));
        }
        state.binds.push(value.clone());
        Ok(())
    }

    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DbError> {
        self.state.0.lock().timeout = Some(timeout);
        Ok(())
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultSet>, DbError> {
        if self.state.0.lock().cancelled {
            return Err(DbError::Cancelled);
        }
        match self.response.take() {
            Some(Ok(rows)) => Ok(Box::new(ScriptedResultSet::new(rows))),
            Some(Err(e)) => Err(e),
            None => Err(DbError::Closed),
        }
    }

    fn cancel(&mut self) {
        self.state.0.lock().cancelled = true;
    }

    fn close(&mut self) {
        self.state.0.lock().closed = true;
    }
}

/// Serves one scripted response per prepared statement, in order.
#[derive(Debug, Default)]
pub(crate) struct ScriptedConnection {
    responses: VecDeque<Result<Vec<Vec<Value>>, DbError>>,
    executed: Vec<String>,
    statements: Vec<StatementState>,
    flushes: usize,
}

impl ScriptedConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&mut self, rows: Vec<Vec<Value>>) {
        self.responses.push_back(Ok(rows));
    }

    pub(crate) fn fail(&mut self, error: DbError) {
        self.responses.push_back(Err(error));
    }

    /// SQL of every prepared statement.
    pub(crate) fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Bind values of every prepared statement.
    pub(crate) fn binds(&self) -> Vec<Vec<Value>> {
        self.statements.iter().map(StatementState::binds).collect()
    }

    pub(crate) fn statements(&self) -> &[StatementState] {
        &self.statements
    }

    pub(crate) fn flushes(&self) -> usize {
        self.flushes
    }
}

impl Connection for ScriptedConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        self.executed.push(sql.to_string());
        let response = self
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(DbError::Sql(format!("no scripted response for: {sql}"))));
        let (stmt, state) = ScriptedStatement::with_response(response);
        self.statements.push(state);
        Ok(Box::new(stmt))
    }

    fn batch_flush(&mut self) -> Result<(), DbError> {
        self.flushes += 1;
        Ok(())
    }
}
