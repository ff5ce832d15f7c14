//! In-memory collection.

use std::sync::Arc;

use sluice_common::types::Record;
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::{
    FieldDef, RecordSource, RecordStream, ScanRequest, SourceSplit, bind_request,
};

use super::project;

/// A collection held in memory. Splits are contiguous row ranges.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    fields: Vec<FieldDef>,
    rows: Arc<[Record]>,
}

impl MemorySource {
    /// Creates a collection.
    ///
    /// # Errors
    ///
    /// Returns a source error if a row's width or values do not match the
    /// declared fields.
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>, rows: Vec<Record>) -> Result<Self> {
        let name = name.into();
        for (index, row) in rows.iter().enumerate() {
            if row.width() != fields.len() {
                return Err(Error::Source(format!(
                    "row {index} of {name} has {} fields, expected {}",
                    row.width(),
                    fields.len()
                )));
            }
            for (field, value) in fields.iter().zip(row.values()) {
                if !field.ty.accepts(value) {
                    return Err(Error::Source(format!(
                        "row {index} of {name}: field {} expects {}, found {}",
                        field.name,
                        field.ty,
                        value.type_name()
                    )));
                }
            }
        }
        Ok(Self {
            name,
            fields,
            rows: rows.into(),
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the collection has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    fn splits(&self, hint: usize) -> Result<Vec<SourceSplit>> {
        Ok(range_splits(&self.name, self.rows.len() as u64, hint))
    }

    fn open(&self, split: &SourceSplit, request: &ScanRequest) -> Result<RecordStream> {
        let (projection, predicates) = bind_request(&self.name, &self.fields, request)?;
        let predicates: Vec<_> = predicates.into_iter().map(|(i, p)| (i, p.clone())).collect();
        let rows = Arc::clone(&self.rows);
        let end = (split.end as usize).min(rows.len());
        let start = (split.start as usize).min(end);
        Ok(Box::new((start..end).filter_map(move |i| {
            let row = &rows[i];
            predicates
                .iter()
                .all(|(slot, p)| row.get(*slot).is_some_and(|v| p.matches(v)))
                .then(|| Ok(project(row, &projection)))
        })))
    }
}

/// Divides `0..len` into at most `hint` contiguous, non-empty ranges. An
/// empty collection still yields one (empty) split.
pub(crate) fn range_splits(source: &str, len: u64, hint: usize) -> Vec<SourceSplit> {
    let parts = (hint.max(1) as u64).min(len.max(1));
    let chunk = len.div_ceil(parts).max(1);
    (0..parts)
        .map(|i| (i * chunk, ((i + 1) * chunk).min(len)))
        .take_while(|&(start, end)| start < end || len == 0)
        .enumerate()
        .map(|(index, (start, end))| SourceSplit {
            source: source.to_string(),
            index,
            start,
            end,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::types::{LogicalType, Value};
    use sluice_core::execution::source::{CompareOp, ScanPredicate};

    fn people() -> MemorySource {
        let fields = vec![
            FieldDef::new("id", LogicalType::Int64),
            FieldDef::new("name", LogicalType::String),
        ];
        let rows = (1..=5)
            .map(|i| Record::new(vec![Value::Int64(i), Value::from(format!("p{i}"))]))
            .collect();
        MemorySource::new("people", fields, rows).unwrap()
    }

    fn read_all(source: &MemorySource, request: &ScanRequest) -> Vec<Record> {
        source
            .splits(2)
            .unwrap()
            .iter()
            .flat_map(|s| source.open(s, request).unwrap())
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_splits_cover_every_row() {
        let source = people();
        let splits = source.splits(2).unwrap();
        assert_eq!(splits.len(), 2);
        let request = ScanRequest {
            fields: vec!["id".into()],
            predicates: vec![],
        };
        assert_eq!(read_all(&source, &request).len(), 5);
    }

    #[test]
    fn test_projection_and_predicates() {
        let request = ScanRequest {
            fields: vec!["name".into()],
            predicates: vec![ScanPredicate::new("id", CompareOp::Gt, 3i64)],
        };
        let rows = read_all(&people(), &request);
        assert_eq!(
            rows,
            vec![Record::new(vec![Value::from("p4")]), Record::new(vec![Value::from("p5")])]
        );
    }

    #[test]
    fn test_rejects_mistyped_rows() {
        let fields = vec![FieldDef::new("id", LogicalType::Int64)];
        let rows = vec![Record::new(vec![Value::from("x")])];
        assert!(MemorySource::new("bad", fields, rows).is_err());
    }

    #[test]
    fn test_range_splits() {
        assert_eq!(range_splits("t", 0, 4).len(), 1);
        let splits = range_splits("t", 10, 3);
        assert_eq!(splits.iter().map(|s| (s.start, s.end)).collect::<Vec<_>>(), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(range_splits("t", 2, 8).len(), 2);
    }
}
