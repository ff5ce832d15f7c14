//! Group-by operator and aggregate functions.
//!
//! A group-by can run in one of three phases:
//!
//! | Phase | Input | Output slots |
//! |-------|-------|--------------|
//! | Complete | raw records | appended after the input slots |
//! | Partial | raw records | appended; partial states (e.g. `[sum, count]` for avg) |
//! | Final | partial records | overwritten in place |
//!
//! Key slots keep their values; every other non-output slot becomes a hole.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::{Error, PlanError, Result};

use super::{Operator, OperatorResult};

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Number of non-null values.
    Count,
    /// Sum of non-null numeric values.
    Sum,
    /// Average of non-null numeric values.
    Avg,
    /// Minimum non-null value.
    Min,
    /// Maximum non-null value.
    Max,
    /// List of non-null values.
    Collect,
}

impl AggregateFunction {
    /// Returns the lowercase function name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Collect => "collect",
        }
    }
}

/// What an aggregate reads from each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateInput {
    /// The value of a slot.
    Slot(usize),
    /// 1 if the slot is non-null, else 0.
    Presence(usize),
}

impl AggregateInput {
    /// Returns the slot read.
    #[must_use]
    pub fn slot(&self) -> usize {
        match self {
            Self::Slot(s) | Self::Presence(s) => *s,
        }
    }

    /// Adds `offset` to the slot read.
    pub fn shift(&mut self, offset: usize) {
        match self {
            Self::Slot(s) | Self::Presence(s) => *s += offset,
        }
    }

    fn read(&self, record: &Record) -> Value {
        match self {
            Self::Slot(s) => record.get(*s).cloned().unwrap_or_default(),
            Self::Presence(s) => {
                let present = record.get(*s).is_some_and(|v| !v.is_null());
                Value::Int64(i64::from(present))
            }
        }
    }
}

/// Phase of a (possibly split) aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupPhase {
    /// Unsplit aggregation.
    #[default]
    Complete,
    /// Pre-shuffle partial aggregation.
    Partial,
    /// Post-shuffle merge of partial aggregates.
    Final,
}

/// Grouping strategy of a single group-by operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupMode {
    /// Hash table over all input; output in first-seen order.
    #[default]
    Hash,
    /// Input is sorted on the keys; groups end when the key changes.
    Sequential,
}

/// One aggregate of a group-by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Function applied.
    pub function: AggregateFunction,
    /// Value read per record.
    pub input: AggregateInput,
    /// Slot receiving the result.
    pub output: usize,
}

impl AggregateSpec {
    /// Creates an aggregate over a slot.
    #[must_use]
    pub fn new(function: AggregateFunction, slot: usize, output: usize) -> Self {
        Self {
            function,
            input: AggregateInput::Slot(slot),
            output,
        }
    }

    /// Returns the pre-shuffle form of this aggregate.
    ///
    /// `count` becomes a `sum` over presence indicators so that the partial
    /// values can be summed after the shuffle.
    #[must_use]
    pub fn partial(&self) -> Self {
        match self.function {
            AggregateFunction::Count => Self {
                function: AggregateFunction::Sum,
                input: AggregateInput::Presence(self.input.slot()),
                output: self.output,
            },
            _ => *self,
        }
    }

    /// Returns the post-shuffle form of this aggregate: it reads the partial
    /// value from its own output slot and overwrites it with the merged one.
    #[must_use]
    pub fn merge(&self) -> Self {
        let function = match self.function {
            AggregateFunction::Count => AggregateFunction::Sum,
            other => other,
        };
        Self {
            function,
            input: AggregateInput::Slot(self.output),
            output: self.output,
        }
    }

    /// Infers the output type for `phase` against the input slot types.
    ///
    /// # Errors
    ///
    /// Returns a plan error for unresolved slots or unsuitable input types.
    pub fn output_type(
        &self,
        input: &[LogicalType],
        phase: GroupPhase,
    ) -> std::result::Result<LogicalType, PlanError> {
        let slot = self.input.slot();
        let ty = input.get(slot).ok_or(PlanError::UnresolvedSlot {
            slot,
            width: input.len(),
        })?;
        if matches!(self.input, AggregateInput::Presence(_)) {
            return Ok(LogicalType::Int64);
        }
        let mismatch = |expected: &str| PlanError::TypeMismatch {
            expected: format!("{expected} input to {}", self.function.name()),
            found: ty.to_string(),
        };
        match (self.function, phase) {
            (AggregateFunction::Count, _) => Ok(LogicalType::Int64),
            (AggregateFunction::Sum, _) if ty.is_numeric() => Ok(ty.clone()),
            (AggregateFunction::Sum, _) => Err(mismatch("numeric")),
            (AggregateFunction::Avg, GroupPhase::Final) => {
                if *ty == avg_state_type() {
                    Ok(LogicalType::Float64)
                } else {
                    Err(mismatch("partial average"))
                }
            }
            (AggregateFunction::Avg, phase) if ty.is_numeric() => Ok(match phase {
                GroupPhase::Partial => avg_state_type(),
                _ => LogicalType::Float64,
            }),
            (AggregateFunction::Avg, _) => Err(mismatch("numeric")),
            (AggregateFunction::Min | AggregateFunction::Max, _) if ty.is_atomic() => Ok(ty.clone()),
            (AggregateFunction::Min | AggregateFunction::Max, _) => Err(mismatch("atomic")),
            (AggregateFunction::Collect, GroupPhase::Final) => match ty {
                LogicalType::List(_) => Ok(ty.clone()),
                _ => Err(mismatch("list")),
            },
            (AggregateFunction::Collect, _) => Ok(LogicalType::List(Box::new(ty.clone()))),
        }
    }
}

fn avg_state_type() -> LogicalType {
    LogicalType::List(Box::new(LogicalType::Float64))
}

/// Running state of one aggregate within one group.
#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum { int: i64, float: f64, is_float: bool, seen: bool },
    Avg { sum: f64, count: f64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Collect(Vec<Value>),
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::Sum => Self::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
                seen: false,
            },
            AggregateFunction::Avg => Self::Avg { sum: 0.0, count: 0.0 },
            AggregateFunction::Min => Self::Min(None),
            AggregateFunction::Max => Self::Max(None),
            AggregateFunction::Collect => Self::Collect(Vec::new()),
        }
    }

    fn update(&mut self, value: Value, phase: GroupPhase) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            Self::Count(n) => *n += 1,
            Self::Sum {
                int,
                float,
                is_float,
                seen,
            } => {
                *seen = true;
                match value {
                    Value::Int64(i) => {
                        *int = int
                            .checked_add(i)
                            .ok_or_else(|| Error::Execution("integer overflow in sum".into()))?;
                    }
                    Value::Float64(f) => {
                        *float += f;
                        *is_float = true;
                    }
                    other => return Err(non_numeric("sum", &other)),
                }
            }
            Self::Avg { sum, count } => {
                if phase == GroupPhase::Final {
                    match value.as_list() {
                        Some([s, c]) => {
                            *sum += s.as_float64().unwrap_or(0.0);
                            *count += c.as_float64().unwrap_or(0.0);
                        }
                        _ => {
                            return Err(Error::Execution(format!(
                                "malformed partial average {value}"
                            )));
                        }
                    }
                } else {
                    *sum += value.as_float64().ok_or_else(|| non_numeric("avg", &value))?;
                    *count += 1.0;
                }
            }
            Self::Min(current) => {
                if current.as_ref().is_none_or(|c| value < *c) {
                    *current = Some(value);
                }
            }
            Self::Max(current) => {
                if current.as_ref().is_none_or(|c| value > *c) {
                    *current = Some(value);
                }
            }
            Self::Collect(items) => match (phase, value) {
                (GroupPhase::Final, Value::List(partial)) => items.extend(partial.iter().cloned()),
                (GroupPhase::Final, other) => {
                    return Err(Error::Execution(format!(
                        "malformed partial collection {other}"
                    )));
                }
                (_, v) => items.push(v),
            },
        }
        Ok(())
    }

    fn finish(self, phase: GroupPhase) -> Value {
        match self {
            Self::Count(n) => Value::Int64(n),
            Self::Sum { seen: false, .. } => Value::Null,
            Self::Sum {
                int,
                float,
                is_float: true,
                ..
            } => Value::Float64(int as f64 + float),
            Self::Sum { int, .. } => Value::Int64(int),
            Self::Avg { sum, count } if phase == GroupPhase::Partial => {
                Value::list(vec![Value::Float64(sum), Value::Float64(count)])
            }
            Self::Avg { count, .. } if count == 0.0 => Value::Null,
            Self::Avg { sum, count } => Value::Float64(sum / count),
            Self::Min(v) | Self::Max(v) => v.unwrap_or_default(),
            Self::Collect(items) => Value::list(items),
        }
    }
}

fn non_numeric(function: &str, value: &Value) -> Error {
    Error::Execution(format!(
        "{function} expects numeric values, found {}",
        value.type_name()
    ))
}

/// Groups records on key slots and evaluates aggregates per group.
pub struct GroupByOperator {
    /// Child operator to read from.
    child: Box<dyn Operator>,
    /// Grouping key slots.
    keys: Vec<usize>,
    /// Aggregates.
    specs: Vec<AggregateSpec>,
    /// Aggregation phase.
    phase: GroupPhase,
    /// Grouping strategy.
    mode: GroupMode,
    /// Width of output records.
    output_width: usize,
    /// Materialized groups (hash mode).
    groups: Option<std::vec::IntoIter<Record>>,
    /// Group under construction (sequential mode).
    current: Option<(Vec<Value>, Vec<Accumulator>)>,
    /// Whether the child is exhausted.
    exhausted: bool,
}

impl GroupByOperator {
    /// Creates a new group-by operator.
    pub fn new(
        child: Box<dyn Operator>,
        keys: Vec<usize>,
        specs: Vec<AggregateSpec>,
        phase: GroupPhase,
        mode: GroupMode,
        input_width: usize,
    ) -> Self {
        let output_width = specs
            .iter()
            .map(|s| s.output + 1)
            .fold(input_width, usize::max);
        Self {
            child,
            keys,
            specs,
            phase,
            mode,
            output_width,
            groups: None,
            current: None,
            exhausted: false,
        }
    }

    fn key_of(&self, record: &Record) -> Vec<Value> {
        self.keys
            .iter()
            .map(|&slot| record.get(slot).cloned().unwrap_or_default())
            .collect()
    }

    fn fresh_accumulators(&self) -> Vec<Accumulator> {
        self.specs.iter().map(|s| Accumulator::new(s.function)).collect()
    }

    fn accumulate(&self, accs: &mut [Accumulator], record: &Record) -> Result<()> {
        for (acc, spec) in accs.iter_mut().zip(&self.specs) {
            acc.update(spec.input.read(record), self.phase)?;
        }
        Ok(())
    }

    fn emit(&self, key: Vec<Value>, accs: Vec<Accumulator>) -> Record {
        let mut out = Record::with_width(self.output_width);
        for (&slot, value) in self.keys.iter().zip(key) {
            out.set(slot, value);
        }
        for (spec, acc) in self.specs.iter().zip(accs) {
            out.set(spec.output, acc.finish(self.phase));
        }
        out
    }

    fn next_hashed(&mut self) -> OperatorResult {
        if self.groups.is_none() {
            let mut table: IndexMap<Vec<Value>, Vec<Accumulator>> = IndexMap::new();
            while let Some(record) = self.child.next()? {
                let key = self.key_of(&record);
                let accs = table
                    .entry(key)
                    .or_insert_with(|| self.fresh_accumulators());
                for (acc, spec) in accs.iter_mut().zip(&self.specs) {
                    acc.update(spec.input.read(&record), self.phase)?;
                }
            }
            let rows: Vec<Record> = table.into_iter().map(|(k, a)| self.emit(k, a)).collect();
            self.groups = Some(rows.into_iter());
        }
        Ok(self.groups.as_mut().and_then(Iterator::next))
    }

    fn next_sequential(&mut self) -> OperatorResult {
        while !self.exhausted {
            let Some(record) = self.child.next()? else {
                self.exhausted = true;
                break;
            };
            let key = self.key_of(&record);
            match self.current.take() {
                Some((current_key, mut accs)) if current_key == key => {
                    self.accumulate(&mut accs, &record)?;
                    self.current = Some((current_key, accs));
                }
                finished => {
                    let mut accs = self.fresh_accumulators();
                    self.accumulate(&mut accs, &record)?;
                    self.current = Some((key, accs));
                    if let Some((k, a)) = finished {
                        return Ok(Some(self.emit(k, a)));
                    }
                }
            }
        }
        Ok(self.current.take().map(|(k, a)| self.emit(k, a)))
    }
}

impl Operator for GroupByOperator {
    fn next(&mut self) -> OperatorResult {
        match self.mode {
            GroupMode::Hash => self.next_hashed(),
            GroupMode::Sequential => self.next_sequential(),
        }
    }

    fn name(&self) -> &'static str {
        match self.mode {
            GroupMode::Hash => "HashGroupBy",
            GroupMode::Sequential => "SequentialGroupBy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::collect_records;
    use crate::execution::operators::testing::{MockScanOperator, rec};

    fn input() -> Vec<Record> {
        vec![
            rec(vec![Value::Int64(1), Value::from("a"), Value::Int64(10)]),
            rec(vec![Value::Int64(1), Value::from("c"), Value::Int64(30)]),
            rec(vec![Value::Int64(2), Value::from("b"), Value::Null]),
        ]
    }

    fn run(
        rows: Vec<Record>,
        specs: Vec<AggregateSpec>,
        phase: GroupPhase,
        mode: GroupMode,
        width: usize,
    ) -> Vec<Record> {
        let child = MockScanOperator::new(rows);
        let mut op = GroupByOperator::new(Box::new(child), vec![0], specs, phase, mode, width);
        collect_records(&mut op).unwrap()
    }

    #[test]
    fn test_complete_count_and_sum() {
        let specs = vec![
            AggregateSpec::new(AggregateFunction::Count, 1, 3),
            AggregateSpec::new(AggregateFunction::Sum, 2, 4),
        ];
        let out = run(input(), specs, GroupPhase::Complete, GroupMode::Hash, 3);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].values(),
            &[Value::Int64(1), Value::Null, Value::Null, Value::Int64(2), Value::Int64(40)]
        );
        // Sum over only nulls is null
        assert_eq!(out[1].get(4), Some(&Value::Null));
    }

    #[test]
    fn test_sequential_matches_hash_on_sorted_input() {
        let specs = vec![AggregateSpec::new(AggregateFunction::Max, 1, 3)];
        let hashed = run(input(), specs.clone(), GroupPhase::Complete, GroupMode::Hash, 3);
        let sequential = run(input(), specs, GroupPhase::Complete, GroupMode::Sequential, 3);
        assert_eq!(hashed, sequential);
    }

    #[test]
    fn test_partial_then_final_count() {
        let count = AggregateSpec::new(AggregateFunction::Count, 1, 3);
        assert_eq!(count.partial().function, AggregateFunction::Sum);
        assert_eq!(count.merge().function, AggregateFunction::Sum);

        // Two workers each see part of the input
        let mut partials = run(
            input()[..2].to_vec(),
            vec![count.partial()],
            GroupPhase::Partial,
            GroupMode::Hash,
            3,
        );
        partials.extend(run(
            input()[1..].to_vec(),
            vec![count.partial()],
            GroupPhase::Partial,
            GroupMode::Hash,
            3,
        ));
        let merged = run(partials, vec![count.merge()], GroupPhase::Final, GroupMode::Hash, 4);
        let counts: Vec<_> = merged.iter().map(|r| r.get(3).cloned().unwrap()).collect();
        // key 1 has two rows (one seen twice across workers), key 2 has one
        assert_eq!(counts, vec![Value::Int64(3), Value::Int64(1)]);
    }

    #[test]
    fn test_partial_and_final_avg() {
        let avg = AggregateSpec::new(AggregateFunction::Avg, 2, 3);
        let partials = run(input(), vec![avg.partial()], GroupPhase::Partial, GroupMode::Hash, 3);
        assert_eq!(
            partials[0].get(3),
            Some(&Value::list(vec![Value::Float64(40.0), Value::Float64(2.0)]))
        );
        let merged = run(partials, vec![avg.merge()], GroupPhase::Final, GroupMode::Hash, 4);
        assert_eq!(merged[0].get(3), Some(&Value::Float64(20.0)));
        assert_eq!(merged[1].get(3), Some(&Value::Null));
    }

    #[test]
    fn test_output_types() {
        let types = vec![LogicalType::Int64, LogicalType::String, LogicalType::Int64];
        let avg = AggregateSpec::new(AggregateFunction::Avg, 2, 3);
        assert_eq!(avg.output_type(&types, GroupPhase::Partial).unwrap(), avg_state_type());
        let sum = AggregateSpec::new(AggregateFunction::Sum, 1, 3);
        assert!(sum.output_type(&types, GroupPhase::Complete).is_err());
        let count = AggregateSpec::new(AggregateFunction::Count, 1, 3).partial();
        assert_eq!(count.output_type(&types, GroupPhase::Partial).unwrap(), LogicalType::Int64);
    }
}
