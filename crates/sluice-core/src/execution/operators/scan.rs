//! Start and scan operators.

use super::{Operator, OperatorResult};
use crate::execution::source::RecordStream;
use sluice_common::types::Record;
use sluice_common::utils::error::Result;

/// Emits a single seed record, then ends.
///
/// The seed has `shift` leading slots reserved for an enclosing stage;
/// they are holes until the record is spliced into its final position.
pub struct StartOperator {
    seed: Option<Record>,
}

impl StartOperator {
    /// Creates a start operator with `shift` pre-filled slots.
    #[must_use]
    pub fn new(shift: usize) -> Self {
        Self {
            seed: Some(Record::with_width(shift)),
        }
    }

    /// Creates a start operator emitting `seed`.
    #[must_use]
    pub fn with_seed(seed: Record) -> Self {
        Self { seed: Some(seed) }
    }
}

impl Operator for StartOperator {
    fn next(&mut self) -> OperatorResult {
        Ok(self.seed.take())
    }

    fn name(&self) -> &'static str {
        "Start"
    }
}

/// Opens a fresh record stream for each input record of a scan.
pub type StreamOpener = Box<dyn FnMut() -> Result<RecordStream> + Send>;

/// For each input record, iterates a record source and appends each source
/// record's fields to a copy of the input record.
pub struct ScanOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Opens the source stream.
    opener: StreamOpener,
    /// Input record currently being extended.
    current: Option<Record>,
    /// Stream for the current input record.
    stream: Option<RecordStream>,
}

impl ScanOperator {
    /// Creates a new scan operator.
    pub fn new(child: Box<dyn Operator>, opener: StreamOpener) -> Self {
        Self {
            child,
            opener,
            current: None,
            stream: None,
        }
    }
}

impl Operator for ScanOperator {
    fn next(&mut self) -> OperatorResult {
        loop {
            if let Some(stream) = self.stream.as_mut() {
                match stream.next() {
                    Some(source_record) => {
                        let mut out = self.current.clone().unwrap_or_default();
                        out.extend_from(&source_record?);
                        return Ok(Some(out));
                    }
                    None => self.stream = None,
                }
            }

            match self.child.next()? {
                Some(input) => {
                    self.current = Some(input);
                    self.stream = Some((self.opener)()?);
                }
                None => return Ok(None),
            }
        }
    }

    fn name(&self) -> &'static str {
        "Scan"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::collect_records;
    use crate::execution::operators::testing::{MockScanOperator, rec};
    use sluice_common::types::Value;

    fn opener(rows: Vec<Record>) -> StreamOpener {
        Box::new(move || {
            let rows = rows.clone();
            Ok(Box::new(rows.into_iter().map(Ok)) as RecordStream)
        })
    }

    #[test]
    fn test_start_emits_once() {
        let mut start = StartOperator::new(2);
        assert_eq!(start.next().unwrap().unwrap().width(), 2);
        assert!(start.next().unwrap().is_none());
    }

    #[test]
    fn test_scan_appends_fields() {
        let rows = vec![rec(vec![Value::Int64(1)]), rec(vec![Value::Int64(2)])];
        let mut scan = ScanOperator::new(Box::new(StartOperator::new(0)), opener(rows));
        let out = collect_records(&mut scan).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].values(), &[Value::Int64(2)]);
    }

    #[test]
    fn test_nested_scan_is_cross_product() {
        let outer = MockScanOperator::new(vec![
            rec(vec![Value::from("a")]),
            rec(vec![Value::from("b")]),
        ]);
        let rows = vec![rec(vec![Value::Int64(1)]), rec(vec![Value::Int64(2)])];
        let mut scan = ScanOperator::new(Box::new(outer), opener(rows));
        let out = collect_records(&mut scan).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[3].values(), &[Value::from("b"), Value::Int64(2)]);
    }
}
