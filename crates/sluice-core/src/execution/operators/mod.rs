//! Physical operators for plan-fragment execution.
//!
//! Operators form a pull-based tree; every call to [`Operator::next`]
//! returns one record or `None` once exhausted:
//!
//! - Start: Emits the seed record of a pipeline
//! - Scan: Iterates a record source per input record
//! - Let / Project: Append a computed slot / build output rows
//! - Filter: Drops records whose predicate is not true
//! - Sort: Local order-by
//! - GroupBy: Hash or sequential grouping with partial/final phases
//! - Join: Local hash join and the tag-ordered streaming hash join

mod aggregate;
mod filter;
pub mod join;
mod project;
mod scan;
mod sort;

pub use aggregate::{
    AggregateFunction, AggregateInput, AggregateSpec, GroupByOperator, GroupMode, GroupPhase,
};
pub use filter::FilterOperator;
pub use join::{JoinState, LocalHashJoin, StreamingHashJoin, StreamingJoinConfig};
pub use project::{LetOperator, ProjectOperator};
pub use scan::{ScanOperator, StartOperator, StreamOpener};
pub use sort::{NullOrder, SortDirection, SortKey, SortOperator, compare_by_keys};

use sluice_common::types::Record;
use sluice_common::utils::error::Result;

use crate::shuffle::TaggedRecord;

/// Result of pulling from an operator.
pub type OperatorResult = Result<Option<Record>>;

/// Trait for physical operators.
pub trait Operator: Send {
    /// Returns the next record, or None if exhausted.
    fn next(&mut self) -> OperatorResult;

    /// Returns the name of this operator for debugging.
    fn name(&self) -> &'static str;
}

/// An operator whose records still carry the branch tag of a join shuffle.
pub trait TaggedOperator: Send {
    /// Returns the next tagged record, or None if exhausted.
    fn next_tagged(&mut self) -> Result<Option<TaggedRecord>>;
}

/// Drains an operator into a vector.
///
/// # Errors
///
/// Returns the first error the operator reports.
pub fn collect_records(op: &mut dyn Operator) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    while let Some(record) = op.next()? {
        out.push(record);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Replays a fixed list of records.
    pub struct MockScanOperator {
        records: std::vec::IntoIter<Record>,
    }

    impl MockScanOperator {
        pub fn new(records: Vec<Record>) -> Self {
            Self {
                records: records.into_iter(),
            }
        }
    }

    impl Operator for MockScanOperator {
        fn next(&mut self) -> OperatorResult {
            Ok(self.records.next())
        }

        fn name(&self) -> &'static str {
            "MockScan"
        }
    }

    /// Replays a fixed list of tagged records.
    pub struct MockTaggedInput {
        records: std::vec::IntoIter<TaggedRecord>,
    }

    impl MockTaggedInput {
        pub fn new(records: Vec<TaggedRecord>) -> Self {
            Self {
                records: records.into_iter(),
            }
        }
    }

    impl TaggedOperator for MockTaggedInput {
        fn next_tagged(&mut self) -> Result<Option<TaggedRecord>> {
            Ok(self.records.next())
        }
    }

    pub fn rec(values: Vec<sluice_common::types::Value>) -> Record {
        Record::new(values)
    }
}
