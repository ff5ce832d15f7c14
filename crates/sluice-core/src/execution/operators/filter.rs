//! Filter operator for applying predicates.

use super::{Operator, OperatorResult};
use crate::execution::expression::ScalarExpr;

/// A filter operator that keeps records whose predicate evaluates to true.
///
/// False and null both drop the record.
pub struct FilterOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Predicate to apply.
    predicate: ScalarExpr,
}

impl FilterOperator {
    /// Creates a new filter operator.
    pub fn new(child: Box<dyn Operator>, predicate: ScalarExpr) -> Self {
        Self { child, predicate }
    }
}

impl Operator for FilterOperator {
    fn next(&mut self) -> OperatorResult {
        while let Some(record) = self.child.next()? {
            if self.predicate.evaluate(&record)?.is_true() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "Filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::expression::BinaryOp;
    use crate::execution::operators::collect_records;
    use crate::execution::operators::testing::{MockScanOperator, rec};
    use sluice_common::types::Value;

    #[test]
    fn test_filter_greater_than() {
        let input = MockScanOperator::new(vec![
            rec(vec![Value::Int64(20)]),
            rec(vec![Value::Int64(30)]),
            rec(vec![Value::Null]),
            rec(vec![Value::Int64(40)]),
        ]);

        // Filter for values > 25
        let predicate =
            ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Gt, ScalarExpr::literal(25i64));
        let mut filter = FilterOperator::new(Box::new(input), predicate);

        let out = collect_records(&mut filter).unwrap();
        assert_eq!(out, vec![rec(vec![Value::Int64(30)]), rec(vec![Value::Int64(40)])]);
    }

    #[test]
    fn test_filter_propagates_errors() {
        let input = MockScanOperator::new(vec![rec(vec![Value::from("x")])]);
        let predicate =
            ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Gt, ScalarExpr::literal(25i64));
        let mut filter = FilterOperator::new(Box::new(input), predicate);
        assert!(filter.next().is_err());
    }
}
