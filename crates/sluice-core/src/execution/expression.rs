//! Scalar expressions evaluated against a single record.
//!
//! Expressions address fields by slot index. Nulls propagate through
//! arithmetic and comparisons; `And`/`Or` use three-valued logic.

use serde::{Deserialize, Serialize};
use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::{Error, PlanError, Result};
use std::cmp::Ordering;

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Logical and.
    And,
    /// Logical or.
    Or,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division, always producing a float.
    Div,
    /// Remainder.
    Mod,
    /// String concatenation.
    Concat,
}

impl BinaryOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Logical not.
    Not,
    /// Numeric negation.
    Neg,
    /// True if the operand is null.
    IsNull,
    /// True if the operand is not null.
    IsNotNull,
}

/// A scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// Reference to a record slot.
    Slot(usize),
    /// A constant.
    Literal(Value),
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<ScalarExpr>,
    },
    /// Binary operation.
    Binary {
        /// Left operand.
        left: Box<ScalarExpr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<ScalarExpr>,
    },
}

impl ScalarExpr {
    /// Creates a slot reference.
    #[must_use]
    pub fn slot(slot: usize) -> Self {
        Self::Slot(slot)
    }

    /// Creates a literal.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a binary expression.
    #[must_use]
    pub fn binary(left: ScalarExpr, op: BinaryOp, right: ScalarExpr) -> Self {
        Self::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Creates a unary expression.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: ScalarExpr) -> Self {
        Self::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Returns the slot if this is a bare slot reference.
    #[must_use]
    pub fn as_slot(&self) -> Option<usize> {
        match self {
            Self::Slot(slot) => Some(*slot),
            _ => None,
        }
    }

    /// Calls `f` for every slot this expression reads.
    pub fn for_each_slot(&self, f: &mut impl FnMut(usize)) {
        match self {
            Self::Slot(slot) => f(*slot),
            Self::Literal(_) => {}
            Self::Unary { operand, .. } => operand.for_each_slot(f),
            Self::Binary { left, right, .. } => {
                left.for_each_slot(f);
                right.for_each_slot(f);
            }
        }
    }

    /// Adds `offset` to every slot reference.
    pub fn shift_slots(&mut self, offset: usize) {
        match self {
            Self::Slot(slot) => *slot += offset,
            Self::Literal(_) => {}
            Self::Unary { operand, .. } => operand.shift_slots(offset),
            Self::Binary { left, right, .. } => {
                left.shift_slots(offset);
                right.shift_slots(offset);
            }
        }
    }

    /// Infers the result type against the input slot types.
    ///
    /// # Errors
    ///
    /// Returns a plan error for unresolved slots or ill-typed operands.
    pub fn result_type(&self, input: &[LogicalType]) -> std::result::Result<LogicalType, PlanError> {
        match self {
            Self::Slot(slot) => input.get(*slot).cloned().ok_or(PlanError::UnresolvedSlot {
                slot: *slot,
                width: input.len(),
            }),
            Self::Literal(value) => literal_type(value),
            Self::Unary { op, operand } => {
                let ty = operand.result_type(input)?;
                match op {
                    UnaryOp::Not => expect_bool(&ty).map(|()| LogicalType::Bool),
                    UnaryOp::Neg => {
                        if ty.is_numeric() {
                            Ok(ty)
                        } else {
                            Err(mismatch("numeric", &ty))
                        }
                    }
                    UnaryOp::IsNull | UnaryOp::IsNotNull => Ok(LogicalType::Bool),
                }
            }
            Self::Binary { left, op, right } => {
                let lt = left.result_type(input)?;
                let rt = right.result_type(input)?;
                match op {
                    BinaryOp::Eq
                    | BinaryOp::Ne
                    | BinaryOp::Lt
                    | BinaryOp::Le
                    | BinaryOp::Gt
                    | BinaryOp::Ge => {
                        let comparable = lt == rt || (lt.is_numeric() && rt.is_numeric());
                        if comparable && lt.is_atomic() {
                            Ok(LogicalType::Bool)
                        } else {
                            Err(mismatch(&lt.to_string(), &rt))
                        }
                    }
                    BinaryOp::And | BinaryOp::Or => {
                        expect_bool(&lt)?;
                        expect_bool(&rt)?;
                        Ok(LogicalType::Bool)
                    }
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod => {
                        numeric_result(&lt, &rt)
                    }
                    BinaryOp::Div => numeric_result(&lt, &rt).map(|_| LogicalType::Float64),
                    BinaryOp::Concat => Ok(LogicalType::String),
                }
            }
        }
    }

    /// Evaluates the expression against a record.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range slots, operand kinds that do not fit
    /// the operator, integer overflow, or division by zero.
    pub fn evaluate(&self, record: &Record) -> Result<Value> {
        match self {
            Self::Slot(slot) => record.get(*slot).cloned().ok_or_else(|| {
                Error::Execution(format!(
                    "slot {slot} out of range for record of width {}",
                    record.width()
                ))
            }),
            Self::Literal(value) => Ok(value.clone()),
            Self::Unary { op, operand } => eval_unary(*op, operand.evaluate(record)?),
            Self::Binary { left, op, right } => {
                let l = left.evaluate(record)?;
                match op {
                    // short-circuit where three-valued logic allows
                    BinaryOp::And if l.as_bool() == Some(false) => Ok(Value::Bool(false)),
                    BinaryOp::Or if l.as_bool() == Some(true) => Ok(Value::Bool(true)),
                    _ => eval_binary(*op, l, right.evaluate(record)?),
                }
            }
        }
    }
}

fn literal_type(value: &Value) -> std::result::Result<LogicalType, PlanError> {
    Ok(match value {
        Value::Null => return Err(mismatch("typed literal", &"NULL")),
        Value::Bool(_) => LogicalType::Bool,
        Value::Int64(_) => LogicalType::Int64,
        Value::Float64(_) => LogicalType::Float64,
        Value::String(_) => LogicalType::String,
        Value::List(items) => {
            let first = items
                .iter()
                .find(|v| !v.is_null())
                .ok_or_else(|| mismatch("non-empty list literal", &"[]"))?;
            LogicalType::List(Box::new(literal_type(first)?))
        }
    })
}

fn mismatch(expected: &str, found: &dyn std::fmt::Display) -> PlanError {
    PlanError::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn expect_bool(ty: &LogicalType) -> std::result::Result<(), PlanError> {
    if *ty == LogicalType::Bool {
        Ok(())
    } else {
        Err(mismatch("BOOL", ty))
    }
}

fn numeric_result(
    lt: &LogicalType,
    rt: &LogicalType,
) -> std::result::Result<LogicalType, PlanError> {
    match (lt, rt) {
        (LogicalType::Int64, LogicalType::Int64) => Ok(LogicalType::Int64),
        (l, r) if l.is_numeric() && r.is_numeric() => Ok(LogicalType::Float64),
        (l, _) if !l.is_numeric() => Err(mismatch("numeric", l)),
        (_, r) => Err(mismatch("numeric", r)),
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> Result<Value> {
    Ok(match (op, value) {
        (UnaryOp::IsNull, v) => Value::Bool(v.is_null()),
        (UnaryOp::IsNotNull, v) => Value::Bool(!v.is_null()),
        (_, Value::Null) => Value::Null,
        (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
        (UnaryOp::Neg, Value::Int64(i)) => Value::Int64(
            i.checked_neg()
                .ok_or_else(|| Error::Execution("integer overflow in negation".into()))?,
        ),
        (UnaryOp::Neg, Value::Float64(f)) => Value::Float64(-f),
        (op, v) => {
            return Err(Error::Execution(format!(
                "cannot apply {op:?} to {}",
                v.type_name()
            )));
        }
    })
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinaryOp::And => Ok(match (l.as_bool(), r.as_bool()) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        }),
        BinaryOp::Or => Ok(match (l.as_bool(), r.as_bool()) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        }),
        BinaryOp::Concat => {
            let mut s = l.to_string();
            s.push_str(&r.to_string());
            Ok(Value::from(s))
        }
        _ if l.is_null() || r.is_null() => Ok(Value::Null),
        op if op.is_comparison() => {
            let ord = compare_values(&l, &r)?;
            Ok(Value::Bool(match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::Ne => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        _ => eval_arithmetic(op, &l, &r),
    }
}

/// Compares two non-null values, widening integers when compared to floats.
///
/// # Errors
///
/// Returns an error when the kinds are not comparable.
pub fn compare_values(l: &Value, r: &Value) -> Result<Ordering> {
    match (l, r) {
        (Value::Int64(a), Value::Float64(b)) => Ok((*a as f64).total_cmp(b)),
        (Value::Float64(a), Value::Int64(b)) => Ok(a.total_cmp(&(*b as f64))),
        _ if l.type_name() == r.type_name() => Ok(l.cmp(r)),
        _ => Err(Error::Execution(format!(
            "cannot compare {} with {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn eval_arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if let (Value::Int64(a), Value::Int64(b)) = (l, r) {
        let overflow = || Error::Execution(format!("integer overflow in {op:?}"));
        return match op {
            BinaryOp::Add => a.checked_add(*b).map(Value::Int64).ok_or_else(overflow),
            BinaryOp::Sub => a.checked_sub(*b).map(Value::Int64).ok_or_else(overflow),
            BinaryOp::Mul => a.checked_mul(*b).map(Value::Int64).ok_or_else(overflow),
            BinaryOp::Mod if *b == 0 => Err(Error::Execution("division by zero".into())),
            BinaryOp::Mod => a.checked_rem(*b).map(Value::Int64).ok_or_else(overflow),
            BinaryOp::Div if *b == 0 => Err(Error::Execution("division by zero".into())),
            _ => Ok(Value::Float64(*a as f64 / *b as f64)),
        };
    }
    let (Some(a), Some(b)) = (l.as_float64(), r.as_float64()) else {
        return Err(Error::Execution(format!(
            "cannot apply {op:?} to {} and {}",
            l.type_name(),
            r.type_name()
        )));
    };
    Ok(Value::Float64(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Mod => a % b,
        _ => {
            if b == 0.0 {
                return Err(Error::Execution("division by zero".into()));
            }
            a / b
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::new(vec![Value::Int64(7), Value::from("a"), Value::Null, Value::Float64(0.5)])
    }

    #[test]
    fn test_comparison() {
        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Gt, ScalarExpr::literal(5i64));
        assert_eq!(expr.evaluate(&record()).unwrap(), Value::Bool(true));

        // Int compared against float widens
        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Lt, ScalarExpr::literal(7.5));
        assert_eq!(expr.evaluate(&record()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_null_propagation() {
        let expr = ScalarExpr::binary(ScalarExpr::slot(2), BinaryOp::Add, ScalarExpr::literal(1i64));
        assert_eq!(expr.evaluate(&record()).unwrap(), Value::Null);

        let and = ScalarExpr::binary(
            ScalarExpr::literal(false),
            BinaryOp::And,
            ScalarExpr::binary(ScalarExpr::slot(2), BinaryOp::Eq, ScalarExpr::literal(1i64)),
        );
        assert_eq!(and.evaluate(&record()).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_arithmetic() {
        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Mul, ScalarExpr::literal(3i64));
        assert_eq!(expr.evaluate(&record()).unwrap(), Value::Int64(21));

        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Div, ScalarExpr::literal(2i64));
        assert_eq!(expr.evaluate(&record()).unwrap(), Value::Float64(3.5));

        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Mod, ScalarExpr::literal(0i64));
        assert!(expr.evaluate(&record()).is_err());
    }

    #[test]
    fn test_result_type() {
        let types = vec![LogicalType::Int64, LogicalType::String, LogicalType::Float64];
        let expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Add, ScalarExpr::slot(2));
        assert_eq!(expr.result_type(&types).unwrap(), LogicalType::Float64);

        let bad = ScalarExpr::binary(ScalarExpr::slot(1), BinaryOp::Sub, ScalarExpr::slot(0));
        assert!(matches!(bad.result_type(&types), Err(PlanError::TypeMismatch { .. })));

        let unresolved = ScalarExpr::slot(9);
        assert_eq!(
            unresolved.result_type(&types),
            Err(PlanError::UnresolvedSlot { slot: 9, width: 3 })
        );
    }

    #[test]
    fn test_shift_slots() {
        let mut expr = ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Eq, ScalarExpr::slot(2));
        expr.shift_slots(3);
        let mut slots = Vec::new();
        expr.for_each_slot(&mut |s| slots.push(s));
        assert_eq!(slots, vec![3, 5]);
    }
}
