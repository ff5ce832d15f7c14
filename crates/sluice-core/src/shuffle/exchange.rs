//! In-process shuffle exchange.
//!
//! Map tasks write encoded pairs into a [`PartitionedOutput`], which routes
//! them with the stage's policy. The [`Exchange`] collects every map task's
//! output as one run per partition and delivers each partition to its reduce
//! task, either fully sorted or by merging runs that are already sorted.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use sluice_common::utils::error::{Error, Result};

use super::policy::ShufflePolicy;

/// An encoded (key, value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShufflePair {
    /// Encoded key.
    pub key: Bytes,
    /// Encoded payload.
    pub value: Bytes,
}

impl ShufflePair {
    /// Creates a pair by copying `key` and `value`.
    #[must_use]
    pub fn copy_from(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        }
    }
}

/// Sink for encoded pairs.
pub trait PairWriter {
    /// Writes one pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying sink fails.
    fn write_pair(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Pull-style source of encoded pairs.
pub trait PairReader: Send {
    /// Returns the next pair, or None once exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn next_pair(&mut self) -> Result<Option<ShufflePair>>;
}

impl PairWriter for Vec<ShufflePair> {
    fn write_pair(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.push(ShufflePair::copy_from(key, value));
        Ok(())
    }
}

/// Replays pairs held in memory.
#[derive(Debug, Default)]
pub struct VecPairReader {
    pairs: std::vec::IntoIter<ShufflePair>,
}

impl VecPairReader {
    /// Creates a reader over `pairs`.
    #[must_use]
    pub fn new(pairs: Vec<ShufflePair>) -> Self {
        Self {
            pairs: pairs.into_iter(),
        }
    }
}

impl PairReader for VecPairReader {
    fn next_pair(&mut self) -> Result<Option<ShufflePair>> {
        Ok(self.pairs.next())
    }
}

/// Map-side output of one task, already split by partition.
#[derive(Debug)]
pub struct PartitionedOutput {
    policy: Arc<dyn ShufflePolicy>,
    partitions: Vec<Vec<ShufflePair>>,
    pairs: usize,
}

impl PartitionedOutput {
    /// Creates an empty output with `partitions` partitions.
    #[must_use]
    pub fn new(policy: Arc<dyn ShufflePolicy>, partitions: usize) -> Self {
        let mut buffers = Vec::with_capacity(partitions.max(1));
        buffers.resize_with(partitions.max(1), Vec::new);
        Self {
            policy,
            partitions: buffers,
            pairs: 0,
        }
    }

    /// Number of pairs written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs == 0
    }

    /// Consumes the output, returning one buffer per partition.
    #[must_use]
    pub fn into_partitions(self) -> Vec<Vec<ShufflePair>> {
        self.partitions
    }
}

impl PairWriter for PartitionedOutput {
    fn write_pair(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let partition = self.policy.partition(key, self.partitions.len());
        self.partitions[partition].push(ShufflePair::copy_from(key, value));
        self.pairs += 1;
        Ok(())
    }
}

/// How a partition's runs become one delivered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Concatenate runs and sort with the policy.
    Sort,
    /// Merge runs that each map task already sorted.
    MergeRuns,
}

/// Collects map outputs and delivers them partition by partition.
#[derive(Debug)]
pub struct Exchange {
    policy: Arc<dyn ShufflePolicy>,
    runs: Vec<Vec<Vec<ShufflePair>>>,
}

impl Exchange {
    /// Creates an exchange with `partitions` partitions.
    #[must_use]
    pub fn new(policy: Arc<dyn ShufflePolicy>, partitions: usize) -> Self {
        let mut runs = Vec::with_capacity(partitions.max(1));
        runs.resize_with(partitions.max(1), Vec::new);
        Self { policy, runs }
    }

    /// Number of partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.runs.len()
    }

    /// Adds one map task's output.
    ///
    /// # Errors
    ///
    /// Returns an error if the output has a different partition count.
    pub fn add_output(&mut self, output: PartitionedOutput) -> Result<()> {
        if output.partitions.len() != self.runs.len() {
            return Err(Error::Internal(format!(
                "map output has {} partitions, exchange has {}",
                output.partitions.len(),
                self.runs.len()
            )));
        }
        for (runs, run) in self.runs.iter_mut().zip(output.into_partitions()) {
            if !run.is_empty() {
                runs.push(run);
            }
        }
        Ok(())
    }

    /// Delivers every partition as one ordered stream.
    #[must_use]
    pub fn deliver(self, mode: DeliveryMode) -> Vec<Vec<ShufflePair>> {
        let policy = self.policy;
        self.runs
            .into_iter()
            .map(|runs| match mode {
                DeliveryMode::Sort => {
                    let mut pairs: Vec<ShufflePair> = runs.into_iter().flatten().collect();
                    merge_sort_by(&mut pairs, &|a, b| policy.compare(&a.key, &b.key));
                    pairs
                }
                DeliveryMode::MergeRuns => merge_runs(runs, policy.as_ref()),
            })
            .collect()
    }
}

/// Stable top-down merge sort. Terminates and keeps every element for any
/// comparator, including inconsistent ones.
pub fn merge_sort_by<T, F>(items: &mut Vec<T>, compare: &F)
where
    F: Fn(&T, &T) -> Ordering,
{
    if items.len() <= 1 {
        return;
    }
    let mut right = items.split_off(items.len() / 2);
    merge_sort_by(items, compare);
    merge_sort_by(&mut right, compare);

    let left = std::mem::take(items);
    items.reserve(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => compare(l, r) == Ordering::Greater,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        items.extend(next);
    }
}

/// K-way merge of sorted runs. Ties go to the earlier run.
fn merge_runs(runs: Vec<Vec<ShufflePair>>, policy: &dyn ShufflePolicy) -> Vec<ShufflePair> {
    let total = runs.iter().map(Vec::len).sum();
    let mut runs: Vec<VecDeque<ShufflePair>> = runs.into_iter().map(VecDeque::from).collect();
    let mut out = Vec::with_capacity(total);
    loop {
        let mut best: Option<(usize, &ShufflePair)> = None;
        for (i, run) in runs.iter().enumerate() {
            let Some(candidate) = run.front() else {
                continue;
            };
            match best {
                Some((_, current)) if policy.compare(&current.key, &candidate.key) != Ordering::Greater => {}
                _ => best = Some((i, candidate)),
            }
        }
        let Some((index, _)) = best else {
            break;
        };
        out.extend(runs[index].pop_front());
    }
    out
}

/// Streams the k-way merge of readers whose pairs are each already in
/// `policy` order. Ties go to the earlier reader.
pub struct MergePairReader {
    policy: Arc<dyn ShufflePolicy>,
    inputs: Vec<Box<dyn PairReader>>,
    heads: Vec<Option<ShufflePair>>,
    primed: bool,
}

impl MergePairReader {
    /// Creates a reader merging `inputs`.
    pub fn new(policy: Arc<dyn ShufflePolicy>, inputs: Vec<Box<dyn PairReader>>) -> Self {
        let heads = inputs.iter().map(|_| None).collect();
        Self {
            policy,
            inputs,
            heads,
            primed: false,
        }
    }
}

impl PairReader for MergePairReader {
    fn next_pair(&mut self) -> Result<Option<ShufflePair>> {
        if !self.primed {
            for (head, input) in self.heads.iter_mut().zip(&mut self.inputs) {
                *head = input.next_pair()?;
            }
            self.primed = true;
        }
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(candidate) = head else {
                continue;
            };
            match best.and_then(|b| self.heads[b].as_ref()) {
                Some(current) if self.policy.compare(&current.key, &candidate.key) != Ordering::Greater => {}
                _ => best = Some(i),
            }
        }
        let Some(index) = best else {
            return Ok(None);
        };
        let next = self.inputs[index].next_pair()?;
        Ok(std::mem::replace(&mut self.heads[index], next))
    }
}
