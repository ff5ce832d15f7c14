//! Streaming hash join over a tag-ordered shuffle.
//!
//! The join shuffle delivers, per sub-partition, every build record (tag 1)
//! before every probe record (tag 0). The operator therefore only ever holds
//! one sub-partition's build side in memory:
//!
//! ```text
//! BUILDING --first probe--> PROBING --next build run--> BUILDING
//!                              |
//!                              +--input exhausted--> DONE
//! ```
//!
//! Build records carry holes in their leading probe-width slots. A match is
//! produced by copying the build record and splicing the probe record over
//! that prefix, so the build side stays reusable for later probes.

use std::collections::VecDeque;

use sluice_common::types::{Record, Value};
use sluice_common::utils::error::{Error, Result};
use tracing::info;

use super::table::{DEFAULT_BUCKET_CAPACITY, DEFAULT_TABLE_SIZE, JoinHashTable};
use crate::execution::operators::{Operator, OperatorResult, TaggedOperator};
use crate::shuffle::{BranchTag, TaggedRecord};

/// Hash table sizing for [`StreamingHashJoin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingJoinConfig {
    /// Number of buckets.
    pub table_size: usize,
    /// Initial capacity of each bucket.
    pub bucket_capacity: usize,
    /// Log bucket statistics after each build.
    pub compute_stats: bool,
}

impl Default for StreamingJoinConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            compute_stats: true,
        }
    }
}

/// State of a [`StreamingHashJoin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Loading build records into the table.
    Building,
    /// Streaming probe records against the table.
    Probing,
    /// Input exhausted and every match emitted.
    Done,
}

/// Inner equi-join consuming a tagged, tag-ordered input.
pub struct StreamingHashJoin {
    input: Box<dyn TaggedOperator>,
    probe_key: usize,
    build_key: usize,
    config: StreamingJoinConfig,
    table: JoinHashTable,
    state: JoinState,
    /// First record of the next phase, read while finishing the current one.
    lookahead: Option<TaggedRecord>,
    /// Matches not yet returned.
    pending: VecDeque<Record>,
    builds: usize,
}

impl StreamingHashJoin {
    /// Creates a join reading probe keys from `probe_key` and build keys from
    /// `build_key`.
    pub fn new(
        input: Box<dyn TaggedOperator>,
        probe_key: usize,
        build_key: usize,
        config: StreamingJoinConfig,
    ) -> Self {
        Self {
            input,
            probe_key,
            build_key,
            table: JoinHashTable::new(config.table_size, config.bucket_capacity),
            config,
            state: JoinState::Building,
            lookahead: None,
            pending: VecDeque::new(),
            builds: 0,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Returns how many build phases have completed.
    #[must_use]
    pub fn builds(&self) -> usize {
        self.builds
    }

    fn pull(&mut self) -> Result<Option<TaggedRecord>> {
        match self.lookahead.take() {
            Some(record) => Ok(Some(record)),
            None => self.input.next_tagged(),
        }
    }

    fn key_of(record: &Record, slot: usize) -> Result<Value> {
        record.get(slot).cloned().ok_or_else(|| {
            Error::Execution(format!(
                "join key slot {slot} out of range for record of width {}",
                record.width()
            ))
        })
    }

    fn build(&mut self) -> Result<()> {
        self.table.clear();
        loop {
            match self.pull()? {
                Some(TaggedRecord { tag, record }) if tag == BranchTag::BUILD => {
                    let key = Self::key_of(&record, self.build_key)?;
                    if !key.is_null() {
                        self.table.insert(key, record);
                    }
                }
                Some(probe) => {
                    self.lookahead = Some(probe);
                    self.state = JoinState::Probing;
                    break;
                }
                None => {
                    self.state = JoinState::Done;
                    break;
                }
            }
        }
        self.builds += 1;
        if self.config.compute_stats {
            let stats = self.table.statistics();
            info!(
                "built hash table with {} buckets and {} records: {stats}",
                stats.buckets, stats.entries
            );
        }
        Ok(())
    }

    fn probe(&mut self, probe: &Record) -> Result<()> {
        let key = Self::key_of(probe, self.probe_key)?;
        if key.is_null() {
            return Ok(());
        }
        for build in self.table.probe(&key) {
            let mut joined = build.clone();
            if !joined.splice_prefix(probe) {
                return Err(Error::Execution(format!(
                    "probe record of width {} is wider than build record of width {}",
                    probe.width(),
                    build.width()
                )));
            }
            self.pending.push_back(joined);
        }
        Ok(())
    }
}

impl Operator for StreamingHashJoin {
    fn next(&mut self) -> OperatorResult {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            match self.state {
                JoinState::Done => return Ok(None),
                JoinState::Building => self.build()?,
                JoinState::Probing => match self.pull()? {
                    Some(TaggedRecord { tag, record }) if tag == BranchTag::PROBE => {
                        self.probe(&record)?;
                    }
                    Some(build) => {
                        // A new build run starts the next sub-partition.
                        self.lookahead = Some(build);
                        self.state = JoinState::Building;
                    }
                    None => self.state = JoinState::Done,
                },
            }
        }
    }

    fn name(&self) -> &'static str {
        "StreamingHashJoin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::collect_records;
    use crate::execution::operators::testing::{MockTaggedInput, rec};

    fn build(key: i64, payload: &str) -> TaggedRecord {
        TaggedRecord {
            tag: BranchTag::BUILD,
            record: rec(vec![Value::Null, Value::Int64(key), Value::from(payload)]),
        }
    }

    fn probe(key: i64, payload: &str) -> TaggedRecord {
        TaggedRecord {
            tag: BranchTag::PROBE,
            record: rec(vec![Value::from(payload), Value::Int64(key)]),
        }
    }

    fn join(input: Vec<TaggedRecord>) -> (Vec<Record>, usize) {
        let config = StreamingJoinConfig {
            table_size: 16,
            ..StreamingJoinConfig::default()
        };
        let mut op = StreamingHashJoin::new(Box::new(MockTaggedInput::new(input)), 1, 1, config);
        let out = collect_records(&mut op).unwrap();
        assert_eq!(op.state(), JoinState::Done);
        (out, op.builds())
    }

    #[test]
    fn test_every_build_match_is_emitted() {
        let (out, _) = join(vec![build(1, "a"), build(1, "b"), probe(1, "x")]);
        assert_eq!(
            out,
            vec![
                rec(vec![Value::from("x"), Value::Int64(1), Value::from("a")]),
                rec(vec![Value::from("x"), Value::Int64(1), Value::from("b")]),
            ]
        );
    }

    #[test]
    fn test_unmatched_keys_produce_nothing() {
        let (out, _) = join(vec![build(1, "a"), probe(2, "x")]);
        assert!(out.is_empty());
        let (out, _) = join(vec![build(1, "a")]);
        assert!(out.is_empty());
        let (out, _) = join(vec![probe(1, "x")]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_build_records_are_reused_across_probes() {
        let (out, _) = join(vec![build(1, "a"), probe(1, "x"), probe(1, "y")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].values()[0], Value::from("y"));
        assert_eq!(out[1].values()[2], Value::from("a"));
    }

    #[test]
    fn test_new_build_run_resets_table() {
        let (out, builds) = join(vec![
            build(1, "a"),
            probe(1, "x"),
            build(2, "b"),
            probe(1, "y"),
            probe(2, "z"),
        ]);
        assert_eq!(builds, 2);
        assert_eq!(
            out,
            vec![
                rec(vec![Value::from("x"), Value::Int64(1), Value::from("a")]),
                rec(vec![Value::from("z"), Value::Int64(2), Value::from("b")]),
            ]
        );
    }

    #[test]
    fn test_single_bucket_table_separates_colliding_keys() {
        let config = StreamingJoinConfig {
            table_size: 1,
            bucket_capacity: 1,
            compute_stats: false,
        };
        let input = vec![build(1, "a"), build(2, "b"), build(1, "c"), probe(2, "x"), probe(1, "y")];
        let mut op = StreamingHashJoin::new(Box::new(MockTaggedInput::new(input)), 1, 1, config);
        let out = collect_records(&mut op).unwrap();
        assert_eq!(
            out,
            vec![
                rec(vec![Value::from("x"), Value::Int64(2), Value::from("b")]),
                rec(vec![Value::from("y"), Value::Int64(1), Value::from("a")]),
                rec(vec![Value::from("y"), Value::Int64(1), Value::from("c")]),
            ]
        );
    }

    #[test]
    fn test_null_keys_never_match() {
        let null_build = TaggedRecord {
            tag: BranchTag::BUILD,
            record: rec(vec![Value::Null, Value::Null, Value::from("a")]),
        };
        let null_probe = TaggedRecord {
            tag: BranchTag::PROBE,
            record: rec(vec![Value::from("x"), Value::Null]),
        };
        let (out, _) = join(vec![null_build, null_probe]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_wide_probe_is_an_error() {
        let wide = TaggedRecord {
            tag: BranchTag::PROBE,
            record: rec(vec![
                Value::from("x"),
                Value::Int64(1),
                Value::Null,
                Value::Null,
            ]),
        };
        let input = MockTaggedInput::new(vec![build(1, "a"), wide]);
        let mut op =
            StreamingHashJoin::new(Box::new(input), 1, 1, StreamingJoinConfig::default());
        assert!(matches!(op.next(), Err(Error::Execution(_))));
    }
}
