//! Local sort operator and sort key definitions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sluice_common::types::{Record, Value};

use super::{Operator, OperatorResult};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

/// Where nulls sort relative to every other value.
///
/// Placement is defined on the ascending order and reversed together with
/// it, so `Greatest` nulls come first in a descending sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NullOrder {
    /// Nulls compare less than every value.
    #[default]
    Least,
    /// Nulls compare greater than every value.
    Greatest,
}

/// One field of a sort or grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Slot to sort on.
    pub slot: usize,
    /// Direction.
    pub direction: SortDirection,
    /// Null placement.
    pub nulls: NullOrder,
}

impl SortKey {
    /// Creates an ascending, nulls-least key.
    #[must_use]
    pub fn ascending(slot: usize) -> Self {
        Self {
            slot,
            direction: SortDirection::Ascending,
            nulls: NullOrder::Least,
        }
    }

    /// Creates a descending, nulls-least key.
    #[must_use]
    pub fn descending(slot: usize) -> Self {
        Self {
            slot,
            direction: SortDirection::Descending,
            nulls: NullOrder::Least,
        }
    }

    /// Sets null placement.
    #[must_use]
    pub fn with_nulls(mut self, nulls: NullOrder) -> Self {
        self.nulls = nulls;
        self
    }

    /// Compares two values under this key.
    #[must_use]
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ord = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match self.nulls {
                NullOrder::Least => Ordering::Less,
                NullOrder::Greatest => Ordering::Greater,
            },
            (false, true) => match self.nulls {
                NullOrder::Least => Ordering::Greater,
                NullOrder::Greatest => Ordering::Less,
            },
            (false, false) => a.cmp(b),
        };
        match self.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    }
}

/// Compares two records key by key.
#[must_use]
pub fn compare_by_keys(a: &Record, b: &Record, keys: &[SortKey]) -> Ordering {
    static NULL: Value = Value::Null;
    for key in keys {
        let ord = key.compare(a.get(key.slot).unwrap_or(&NULL), b.get(key.slot).unwrap_or(&NULL));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Materializes its input and emits it sorted. The sort is stable.
pub struct SortOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Sort keys, most significant first.
    keys: Vec<SortKey>,
    /// Sorted output once materialized.
    sorted: Option<std::vec::IntoIter<Record>>,
}

impl SortOperator {
    /// Creates a new sort operator.
    pub fn new(child: Box<dyn Operator>, keys: Vec<SortKey>) -> Self {
        Self {
            child,
            keys,
            sorted: None,
        }
    }
}

impl Operator for SortOperator {
    fn next(&mut self) -> OperatorResult {
        if self.sorted.is_none() {
            let mut records = Vec::new();
            while let Some(record) = self.child.next()? {
                records.push(record);
            }
            records.sort_by(|a, b| compare_by_keys(a, b, &self.keys));
            self.sorted = Some(records.into_iter());
        }
        Ok(self.sorted.as_mut().and_then(Iterator::next))
    }

    fn name(&self) -> &'static str {
        "Sort"
    }
}
