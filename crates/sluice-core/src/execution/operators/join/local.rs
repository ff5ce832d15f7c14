//! In-memory hash join for joins evaluated inside a single task.

use std::collections::VecDeque;

use sluice_common::types::{Record, Value};
use sluice_common::utils::hash::{FixedHashMap, fixed_map};

use crate::execution::operators::{Operator, OperatorResult};

/// Inner equi-join that materializes the right input, then streams the left.
///
/// Output records are the left record followed by the right record.
pub struct LocalHashJoin {
    left: Box<dyn Operator>,
    right: Option<Box<dyn Operator>>,
    left_key: usize,
    right_key: usize,
    table: FixedHashMap<Value, Vec<Record>>,
    pending: VecDeque<Record>,
}

impl LocalHashJoin {
    /// Creates a join of `left.left_key == right.right_key`.
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        left_key: usize,
        right_key: usize,
    ) -> Self {
        Self {
            left,
            right: Some(right),
            left_key,
            right_key,
            table: fixed_map(),
            pending: VecDeque::new(),
        }
    }

    fn build(&mut self) -> sluice_common::utils::error::Result<()> {
        if let Some(mut right) = self.right.take() {
            while let Some(record) = right.next()? {
                match record.get(self.right_key) {
                    Some(key) if !key.is_null() => {
                        self.table.entry(key.clone()).or_default().push(record);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl Operator for LocalHashJoin {
    fn next(&mut self) -> OperatorResult {
        self.build()?;
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            let Some(left) = self.left.next()? else {
                return Ok(None);
            };
            let Some(matches) = left.get(self.left_key).and_then(|k| self.table.get(k)) else {
                continue;
            };
            for right in matches {
                let mut joined = left.clone();
                joined.extend_from(right);
                self.pending.push_back(joined);
            }
        }
    }

    fn name(&self) -> &'static str {
        "LocalHashJoin"
    }
}
