//! Static field types.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Value;

/// The declared type of a record slot.
///
/// Every slot of every record has a type known from the plan fragment that
/// produced it. Nulls are admitted in any slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    String,
    /// Homogeneous list of values.
    List(Box<LogicalType>),
}

impl LogicalType {
    /// Returns true for types that can participate in a grouping key.
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        !matches!(self, Self::List(_))
    }

    /// Returns true for numeric types.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    /// Returns true if `value` may be stored in a slot of this type.
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Bool, Value::Bool(_))
            | (Self::Int64, Value::Int64(_))
            | (Self::Float64, Value::Float64(_))
            | (Self::String, Value::String(_)) => true,
            (Self::List(element), Value::List(items)) => items.iter().all(|v| element.accepts(v)),
            _ => false,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOL"),
            Self::Int64 => write!(f, "INT64"),
            Self::Float64 => write!(f, "FLOAT64"),
            Self::String => write!(f, "STRING"),
            Self::List(element) => write!(f, "LIST<{element}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        assert!(LogicalType::Int64.accepts(&Value::Int64(3)));
        assert!(LogicalType::Int64.accepts(&Value::Null));
        assert!(!LogicalType::Int64.accepts(&Value::Float64(3.0)));

        let list = LogicalType::List(Box::new(LogicalType::String));
        assert!(list.accepts(&Value::list(vec![Value::from("a"), Value::Null])));
        assert!(!list.accepts(&Value::list(vec![Value::Int64(1)])));
        assert!(!list.is_atomic());
    }

    #[test]
    fn test_display() {
        let list = LogicalType::List(Box::new(LogicalType::Float64));
        assert_eq!(list.to_string(), "LIST<FLOAT64>");
    }
}
