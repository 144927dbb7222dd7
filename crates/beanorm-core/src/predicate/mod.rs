//! Predicate compilation: where, having and order by clauses from
//! property paths to column SQL with ordered bind values.

mod compiler;
mod deploy;
mod expr;
mod order;

pub use compiler::{BindValues, CompiledPredicates, PredicateCompiler};
pub use deploy::{DeployParser, ParamRef, ParsedClause};
pub use expr::RenderedExpr;
pub use order::{repair_order, ManyOrder};
