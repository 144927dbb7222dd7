//! Order by repair for master/detail queries.
//!
//! The reader groups detail rows by master id, so every row of one master
//! must be adjacent. That holds only when the root id columns are ordered
//! before any column of the join fetched to-many.

use beanorm_proto::{OrderDirection, OrderSpec};
use tracing::{debug, warn};

/// The join fetched to-many as seen by the order repair.
#[derive(Debug, Clone, Copy)]
pub struct ManyOrder<'a> {
    /// Association path of the to-many.
    pub path: &'a str,
    /// Default order of the collection (a property path on the target).
    pub default_order: Option<&'a str>,
}

/// Return `order_by` with root ids inserted before the first reference to
/// the to-many, or appended when the to-many is not referenced. Applying
/// the repair to its own output is a no-op.
pub fn repair_order(order_by: &[OrderSpec], id_paths: &[&str], many: Option<ManyOrder<'_>>) -> Vec<OrderSpec> {
    let Some(many) = many else {
        return order_by.to_vec();
    };

    let mut repaired = order_by.to_vec();
    let first_many = repaired.iter().position(|o| o.references(many.path));
    let boundary = first_many.unwrap_or(repaired.len());

    let missing: Vec<OrderSpec> = id_paths
        .iter()
        .filter(|id| !repaired[..boundary].iter().any(|o| o.path == **id))
        .map(|id| OrderSpec::asc(*id))
        .collect();

    if !missing.is_empty() {
        if first_many.is_some() {
            warn!(
                many = %many.path,
                order_by = %render_paths(order_by),
                "Order by places to-many columns before the root id; inserting id columns"
            );
        } else if !order_by.is_empty() {
            debug!(order_by = %render_paths(order_by), "Appending root id to order by");
        }
        let tail = repaired.split_off(boundary);
        repaired.extend(missing);
        repaired.extend(tail);
    }

    if first_many.is_none() {
        if let Some(default) = many.default_order {
            repaired.push(OrderSpec::asc(format!("{}.{default}", many.path)));
        }
    }
    repaired
}

fn render_paths(order_by: &[OrderSpec]) -> String {
    order_by
        .iter()
        .map(|o| match o.direction {
            OrderDirection::Asc => o.path.clone(),
            OrderDirection::Desc => format!("{} desc", o.path),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAILS: ManyOrder<'static> = ManyOrder {
        path: "details",
        default_order: Some("id"),
    };

    fn paths(order: &[OrderSpec]) -> Vec<String> {
        order.iter().map(|o| o.path.clone()).collect()
    }

    #[test]
    fn test_no_many_untouched() {
        let order = vec![OrderSpec::desc("status")];
        assert_eq!(repair_order(&order, &["id"], None), order);
    }

    #[test]
    fn test_empty_order_gets_ids_and_default() {
        let repaired = repair_order(&[], &["id"], Some(DETAILS));
        assert_eq!(paths(&repaired), vec!["id", "details.id"]);
    }

    #[test]
    fn test_insert_before_many_reference() {
        let order = vec![OrderSpec::asc("status"), OrderSpec::desc("details.qty")];
        let repaired = repair_order(&order, &["id"], Some(DETAILS));
        assert_eq!(paths(&repaired), vec!["status", "id", "details.qty"]);
        assert_eq!(repaired[2].direction, OrderDirection::Desc);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let inputs = vec![
            vec![],
            vec![OrderSpec::desc("details.qty"), OrderSpec::asc("status")],
            vec![OrderSpec::asc("status")],
            vec![OrderSpec::asc("id"), OrderSpec::asc("details.id")],
        ];
        for order in inputs {
            let once = repair_order(&order, &["id"], Some(DETAILS));
            let twice = repair_order(&once, &["id"], Some(DETAILS));
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_already_correct_is_unchanged() {
        let order = vec![OrderSpec::desc("id"), OrderSpec::asc("details.qty")];
        assert_eq!(repair_order(&order, &["id"], Some(DETAILS)), order);
    }

    #[test]
    fn test_compound_id() {
        let repaired = repair_order(
            &[OrderSpec::asc("details.qty")],
            &["code", "region"],
            Some(ManyOrder {
                path: "details",
                default_order: None,
            }),
        );
        assert_eq!(paths(&repaired), vec!["code", "region", "details.qty"]);
    }
}
