//! Record source interface.
//!
//! Sources are collections the front-end declares by name. A scan asks a
//! source for its input splits and then opens one split at a time, passing
//! the fields it needs and the simple predicates it wants applied.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::Result;

/// A named, typed field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: LogicalType,
}

impl FieldDef {
    /// Creates a field definition.
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A comparison operator usable in pushed-down predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
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
}

/// A per-field comparison against a constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPredicate {
    /// Field name.
    pub field: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Constant to compare against.
    pub value: Value,
}

impl ScanPredicate {
    /// Creates a predicate.
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Tests a field value. Nulls never satisfy a predicate.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() || self.value.is_null() {
            return false;
        }
        let Ok(ord) = crate::execution::expression::compare_values(value, &self.value) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => ord.is_eq(),
            CompareOp::Ne => ord.is_ne(),
            CompareOp::Lt => ord.is_lt(),
            CompareOp::Le => ord.is_le(),
            CompareOp::Gt => ord.is_gt(),
            CompareOp::Ge => ord.is_ge(),
        }
    }
}

/// What a scan wants from a source: projected fields, in order, and the
/// predicates every returned record must satisfy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    /// Names of the fields to return, in output order.
    pub fields: Vec<String>,
    /// Conjunctive predicates over source fields.
    pub predicates: Vec<ScanPredicate>,
}

/// One independently readable piece of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSplit {
    /// Collection name.
    pub source: String,
    /// Position of the split within the source.
    pub index: usize,
    /// Source-specific start offset (inclusive).
    pub start: u64,
    /// Source-specific end offset (exclusive).
    pub end: u64,
}

/// A stream of records read from a split.
pub type RecordStream = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// A readable collection.
pub trait RecordSource: Send + Sync {
    /// Returns the collection name.
    fn name(&self) -> &str;

    /// Returns the declared fields.
    fn fields(&self) -> &[FieldDef];

    /// Divides the source into roughly `hint` splits. Never returns zero
    /// splits for a readable source.
    fn splits(&self, hint: usize) -> Result<Vec<SourceSplit>>;

    /// Opens one split.
    fn open(&self, split: &SourceSplit, request: &ScanRequest) -> Result<RecordStream>;
}

/// Resolves collections by name.
pub trait SourceCatalog: Send + Sync {
    /// Returns the source registered under `name`.
    fn resolve(&self, name: &str) -> Option<Arc<dyn RecordSource>>;
}

impl fmt::Debug for dyn RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSource")
            .field("name", &self.name())
            .field("fields", &self.fields().len())
            .finish()
    }
}

/// Resolves the positions of `request.fields` and `request.predicates`
/// within `fields`.
///
/// Returns `(projection, predicates)` where each predicate is paired with the
/// index of the field it tests.
///
/// # Errors
///
/// Returns a source error naming the first unknown field.
pub fn bind_request<'a>(
    source: &str,
    fields: &[FieldDef],
    request: &'a ScanRequest,
) -> Result<(Vec<usize>, Vec<(usize, &'a ScanPredicate)>)> {
    let position = |name: &str| {
        fields.iter().position(|f| f.name == name).ok_or_else(|| {
            sluice_common::utils::error::Error::Source(format!(
                "collection {source} has no field {name}"
            ))
        })
    };
    let projection = request
        .fields
        .iter()
        .map(|name| position(name))
        .collect::<Result<Vec<_>>>()?;
    let predicates = request
        .predicates
        .iter()
        .map(|p| position(&p.field).map(|i| (i, p)))
        .collect::<Result<Vec<_>>>()?;
    Ok((projection, predicates))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_matches() {
        let p = ScanPredicate::new("qty", CompareOp::Ge, 10i64);
        assert!(p.matches(&Value::Int64(10)));
        assert!(!p.matches(&Value::Int64(9)));
        assert!(!p.matches(&Value::Null));
        assert!(!p.matches(&Value::from("ten")));
    }

    #[test]
    fn test_bind_request() {
        let fields = vec![
            FieldDef::new("id", LogicalType::Int64),
            FieldDef::new("name", LogicalType::String),
        ];
        let request = ScanRequest {
            fields: vec!["name".into(), "id".into()],
            predicates: vec![ScanPredicate::new("id", CompareOp::Eq, 1i64)],
        };
        let (projection, predicates) = bind_request("people", &fields, &request).unwrap();
        assert_eq!(projection, vec![1, 0]);
        assert_eq!(predicates[0].0, 0);

        let bad = ScanRequest {
            fields: vec!["age".into()],
            predicates: vec![],
        };
        assert!(bind_request("people", &fields, &bad).is_err());
    }
}
