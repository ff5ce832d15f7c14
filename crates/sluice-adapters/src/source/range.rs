//! Integer range collection.

use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::{
    FieldDef, RecordSource, RecordStream, ScanRequest, SourceSplit, bind_request,
};

use super::memory::range_splits;
use super::project;

/// The integers `start..end`, in one `Int64` field named `value`.
#[derive(Debug, Clone)]
pub struct RangeSource {
    name: String,
    fields: Vec<FieldDef>,
    start: i64,
    end: i64,
}

impl RangeSource {
    /// Creates a range collection.
    ///
    /// # Errors
    ///
    /// Returns a source error if `end < start`.
    pub fn new(name: impl Into<String>, start: i64, end: i64) -> Result<Self> {
        let name = name.into();
        if end < start {
            return Err(Error::Source(format!("range {name} ends before it starts")));
        }
        Ok(Self {
            name,
            fields: vec![FieldDef::new("value", LogicalType::Int64)],
            start,
            end,
        })
    }
}

impl RecordSource for RangeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    fn splits(&self, hint: usize) -> Result<Vec<SourceSplit>> {
        Ok(range_splits(&self.name, self.end.abs_diff(self.start), hint))
    }

    fn open(&self, split: &SourceSplit, request: &ScanRequest) -> Result<RecordStream> {
        let (projection, predicates) = bind_request(&self.name, &self.fields, request)?;
        let predicates: Vec<_> = predicates.into_iter().map(|(_, p)| p.clone()).collect();
        let first = self.start.saturating_add_unsigned(split.start);
        let last = self.start.saturating_add_unsigned(split.end).min(self.end);
        Ok(Box::new((first..last).filter_map(move |i| {
            let value = Value::Int64(i);
            predicates
                .iter()
                .all(|p| p.matches(&value))
                .then(|| Ok(project(&Record::new(vec![value]), &projection)))
        })))
    }
}
