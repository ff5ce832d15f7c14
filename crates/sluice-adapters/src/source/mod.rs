//! Record sources.
//!
//! | Source | Splits | Fields |
//! |--------|--------|--------|
//! | [`MemorySource`] | row ranges | declared |
//! | [`RangeSource`] | integer ranges | `value: INT64` |
//! | [`DelimitedSource`] | line-aligned byte ranges | declared |
//!
//! [`SourceSpec`] describes any of them in a serializable form, which is how
//! catalog files declare collections.

mod csv;
mod memory;
mod range;

pub use csv::DelimitedSource;
pub use memory::MemorySource;
pub use range::RangeSource;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::{FieldDef, RecordSource};

/// Selects `projection` from `record`, in projection order.
pub(crate) fn project(record: &Record, projection: &[usize]) -> Record {
    Record::new(
        projection
            .iter()
            .map(|&i| record.get(i).cloned().unwrap_or_default())
            .collect(),
    )
}

/// Serializable description of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Rows given inline as JSON scalars.
    Memory {
        /// Collection name.
        name: String,
        /// Declared fields.
        fields: Vec<FieldDef>,
        /// Rows, one JSON value per field.
        rows: Vec<Vec<serde_json::Value>>,
    },
    /// Integers `start..end`.
    Range {
        /// Collection name.
        name: String,
        /// First value.
        start: i64,
        /// One past the last value.
        end: i64,
    },
    /// A delimited text file.
    Delimited {
        /// Collection name.
        name: String,
        /// File path.
        path: PathBuf,
        /// Declared fields, in file order.
        fields: Vec<FieldDef>,
        /// Field delimiter.
        #[serde(default = "default_delimiter")]
        delimiter: char,
        /// Whether the first line is a header.
        #[serde(default)]
        header: bool,
    },
}

fn default_delimiter() -> char {
    ','
}

impl SourceSpec {
    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Memory { name, .. } | Self::Range { name, .. } | Self::Delimited { name, .. } => {
                name
            }
        }
    }

    /// Instantiates the source.
    ///
    /// # Errors
    ///
    /// Returns a source error if the description is invalid.
    pub fn build(&self) -> Result<Arc<dyn RecordSource>> {
        Ok(match self {
            Self::Memory { name, fields, rows } => {
                let rows = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .zip(fields)
                            .map(|(json, field)| json_value(json, &field.ty))
                            .collect::<Result<Vec<_>>>()
                            .map(Record::new)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(MemorySource::new(name.clone(), fields.clone(), rows)?)
            }
            Self::Range { name, start, end } => Arc::new(RangeSource::new(name.clone(), *start, *end)?),
            Self::Delimited {
                name,
                path,
                fields,
                delimiter,
                header,
            } => {
                let delimiter = u8::try_from(*delimiter).map_err(|_| {
                    Error::Source(format!("delimiter of {name} must be a single byte"))
                })?;
                Arc::new(DelimitedSource::new(name.clone(), path, fields.clone(), delimiter, *header)?)
            }
        })
    }
}

/// Converts a JSON value to a value of type `ty`.
///
/// # Errors
///
/// Returns a source error if the JSON value does not fit the type.
pub fn json_value(json: &serde_json::Value, ty: &LogicalType) -> Result<Value> {
    use serde_json::Value as Json;
    let mismatch = || Error::Source(format!("cannot read {json} as {ty}"));
    Ok(match (ty, json) {
        (_, Json::Null) => Value::Null,
        (LogicalType::Bool, Json::Bool(b)) => Value::Bool(*b),
        (LogicalType::Int64, Json::Number(n)) => Value::Int64(n.as_i64().ok_or_else(mismatch)?),
        (LogicalType::Float64, Json::Number(n)) => Value::Float64(n.as_f64().ok_or_else(mismatch)?),
        (LogicalType::String, Json::String(s)) => Value::from(s.as_str()),
        (LogicalType::List(element), Json::Array(items)) => Value::list(
            items
                .iter()
                .map(|item| json_value(item, element))
                .collect::<Result<Vec<_>>>()?,
        ),
        _ => return Err(mismatch()),
    })
}

/// Converts a value to JSON.
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int64(i) => Json::from(*i),
        Value::Float64(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.to_string()),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::execution::source::ScanRequest;

    #[test]
    fn test_memory_spec_from_json() {
        let spec: SourceSpec = serde_json::from_str(
            r#"{
                "kind": "memory",
                "name": "t",
                "fields": [{"name": "k", "ty": "Int64"}, {"name": "v", "ty": "String"}],
                "rows": [[1, "a"], [2, null]]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.name(), "t");
        let source = spec.build().unwrap();
        let split = &source.splits(1).unwrap()[0];
        let request = ScanRequest {
            fields: vec!["v".into()],
            predicates: vec![],
        };
        let rows: Vec<_> = source.open(split, &request).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows[1].get(0), Some(&Value::Null));
    }

    #[test]
    fn test_json_values() {
        let list = LogicalType::List(Box::new(LogicalType::Int64));
        let json = serde_json::json!([1, 2]);
        let value = json_value(&json, &list).unwrap();
        assert_eq!(value, Value::list(vec![Value::Int64(1), Value::Int64(2)]));
        assert_eq!(value_to_json(&value), json);
        assert!(json_value(&serde_json::json!("x"), &LogicalType::Int64).is_err());
    }
}
