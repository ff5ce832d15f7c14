//! Let and project operators.

use super::{Operator, OperatorResult};
use crate::execution::expression::ScalarExpr;
use sluice_common::types::Record;

/// Appends the value of an expression as a new trailing slot.
pub struct LetOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Bound expression.
    expression: ScalarExpr,
}

impl LetOperator {
    /// Creates a new let operator.
    pub fn new(child: Box<dyn Operator>, expression: ScalarExpr) -> Self {
        Self { child, expression }
    }
}

impl Operator for LetOperator {
    fn next(&mut self) -> OperatorResult {
        let Some(mut record) = self.child.next()? else {
            return Ok(None);
        };
        let value = self.expression.evaluate(&record)?;
        record.push(value);
        Ok(Some(record))
    }

    fn name(&self) -> &'static str {
        "Let"
    }
}

/// Builds output rows from a list of expressions.
pub struct ProjectOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Projection expressions.
    projections: Vec<ScalarExpr>,
}

impl ProjectOperator {
    /// Creates a new project operator.
    pub fn new(child: Box<dyn Operator>, projections: Vec<ScalarExpr>) -> Self {
        Self { child, projections }
    }

    /// Creates a project operator that selects specific slots.
    pub fn select_slots(child: Box<dyn Operator>, slots: Vec<usize>) -> Self {
        let projections = slots.into_iter().map(ScalarExpr::Slot).collect();
        Self::new(child, projections)
    }
}

impl Operator for ProjectOperator {
    fn next(&mut self) -> OperatorResult {
        let Some(input) = self.child.next()? else {
            return Ok(None);
        };
        let values = self
            .projections
            .iter()
            .map(|p| p.evaluate(&input))
            .collect::<sluice_common::utils::error::Result<Vec<_>>>()?;
        Ok(Some(Record::new(values)))
    }

    fn name(&self) -> &'static str {
        "Project"
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
    fn test_let_appends_slot() {
        let input = MockScanOperator::new(vec![rec(vec![Value::Int64(2)])]);
        let doubled =
            ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Mul, ScalarExpr::literal(2i64));
        let mut op = LetOperator::new(Box::new(input), doubled);
        let out = collect_records(&mut op).unwrap();
        assert_eq!(out[0].values(), &[Value::Int64(2), Value::Int64(4)]);
    }

    #[test]
    fn test_project_select_slots() {
        let input = MockScanOperator::new(vec![rec(vec![
            Value::Int64(1),
            Value::from("a"),
            Value::Bool(true),
        ])]);
        let mut op = ProjectOperator::select_slots(Box::new(input), vec![2, 0]);
        let out = collect_records(&mut op).unwrap();
        assert_eq!(out[0].values(), &[Value::Bool(true), Value::Int64(1)]);
    }
}
