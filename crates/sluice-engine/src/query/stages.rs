//! Stage graph construction.
//!
//! A rewritten plan is cut at its shuffle boundaries into stages. Each stage
//! runs a map fragment per input split and, if it owns a shuffle, a reduce
//! fragment per partition. A branch that needs a shuffle of its own becomes a
//! separate stage whose output the consuming stage reads back as a dataset.
//!
//! Join branches are partitioning stages: each shuffles its records with the
//! join policy and writes one sorted part per partition. The stage consuming
//! the join merges part `p` of both branches in map task `p`, so a join
//! feeding a group-by takes three stages.
//!
//! Stages are numbered in dependency order: every stage's inputs have lower
//! sequence numbers, and the terminal stage comes last.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use sluice_adapters::storage::temp_dataset_name;
use sluice_common::utils::error::{Error, PlanError, Result};
use sluice_core::shuffle::PolicyKind;
use tracing::debug;

use super::plan::{
    ExchangeOp, LogicalOperator, LogicalPlan, PartitionedSource, PhaseOutOp, ShuffleAnnotation,
    ShuffleOp, ShuffleSite, StageInputOp,
};
use crate::config::Config;

/// Where a stage's output goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutput {
    /// Encoded pairs in a named dataset, read by a later stage.
    Dataset(String),
    /// Rows returned to the caller.
    Collect,
}

impl fmt::Display for StageOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset(name) => write!(f, "dataset {name}"),
            Self::Collect => write!(f, "collect"),
        }
    }
}

/// The shuffle a stage owns between its map and reduce side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleSpec {
    /// Operator the shuffle was introduced for.
    pub site: ShuffleSite,
    /// Partition and order policy.
    pub policy: PolicyKind,
    /// Map outputs arrive sorted; reducers only merge them.
    pub skip_sort: bool,
    /// Number of reduce partitions.
    pub partitions: usize,
}

impl ShuffleSpec {
    /// Resolves the shuffle of a boundary under `config`.
    #[must_use]
    pub fn from_annotation(annotation: &ShuffleAnnotation, config: &Config) -> Self {
        let (policy, partitions) = match annotation.site {
            // A total order needs every key in one partition.
            ShuffleSite::OrderBy => (PolicyKind::TotalOrder, 1),
            ShuffleSite::GroupBy => (PolicyKind::TotalOrder, config.reduce_partitions),
            ShuffleSite::Join => (
                PolicyKind::Join {
                    sub_partitions: config.hash_join_partitions,
                },
                config.reduce_partitions,
            ),
        };
        Self {
            site: annotation.site,
            policy,
            skip_sort: annotation.skip_sort,
            partitions,
        }
    }
}

/// The operator trees one stage runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFragment {
    /// Map-side pipelines. With a reduce side each is rooted at a phase-out.
    pub map: Vec<LogicalOperator>,
    /// Reduce-side pipeline, reading the stage's exchange. A stage with a
    /// shuffle and no reduce pipeline writes each delivered partition as one
    /// part of its dataset.
    pub reduce: Option<LogicalOperator>,
}

/// A self-contained unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Sequence number.
    pub seq: usize,
    /// Serialized [`StageFragment`].
    pub fragment: Vec<u8>,
    /// Stages whose output this stage reads.
    pub inputs: Vec<usize>,
    /// The stage's own shuffle.
    pub shuffle: Option<ShuffleSpec>,
    /// Output destination.
    pub output: StageOutput,
    /// Whether this stage produces the query result.
    pub is_terminal: bool,
}

impl StageDescriptor {
    /// Decodes the stage's operator trees.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the fragment bytes are corrupt.
    pub fn fragment(&self) -> Result<StageFragment> {
        let (fragment, _) =
            bincode::serde::decode_from_slice(&self.fragment, bincode::config::standard())
                .map_err(|e| Error::Serialization(format!("stage {}: {e}", self.seq)))?;
        Ok(fragment)
    }

    /// Returns true if the stage has no reduce side.
    #[must_use]
    pub fn is_map_only(&self) -> bool {
        self.shuffle.is_none()
    }
}

/// Stages of one query, in dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageGraph {
    /// Job name datasets are named after.
    pub job_name: String,
    /// Stages indexed by sequence number.
    pub stages: Vec<StageDescriptor>,
    /// Sequence number of the terminal stage.
    pub terminal: usize,
}

impl StageGraph {
    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the stage with sequence number `seq`.
    #[must_use]
    pub fn stage(&self, seq: usize) -> Option<&StageDescriptor> {
        self.stages.get(seq)
    }

    /// Groups stages into waves; every stage's inputs are in earlier waves.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.stages.len()];
        for stage in &self.stages {
            depth[stage.seq] = stage
                .inputs
                .iter()
                .map(|&i| depth[i] + 1)
                .max()
                .unwrap_or(0);
        }
        let levels = depth.iter().max().map_or(0, |d| d + 1);
        let mut waves = vec![Vec::new(); levels];
        for (seq, d) in depth.into_iter().enumerate() {
            waves[d].push(seq);
        }
        waves
    }

    /// Renders one line per stage followed by its fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if a fragment cannot be decoded.
    pub fn explain(&self) -> Result<String> {
        let mut out = String::new();
        for stage in &self.stages {
            let shuffle = match &stage.shuffle {
                Some(s) => format!(
                    "{} shuffle, {} x{}{}",
                    s.site,
                    s.policy,
                    s.partitions,
                    if s.skip_sort { ", skip-sort" } else { "" }
                ),
                None => "map only".to_string(),
            };
            let _ = writeln!(
                out,
                "Stage {}{}: inputs {:?}, {}, output {}",
                stage.seq,
                if stage.is_terminal { " (terminal)" } else { "" },
                stage.inputs,
                shuffle,
                stage.output
            );
            let fragment = stage.fragment()?;
            for map in &fragment.map {
                out.push_str("  map:\n");
                map.explain_into(&mut out, 2);
            }
            if let Some(reduce) = &fragment.reduce {
                out.push_str("  reduce:\n");
                reduce.explain_into(&mut out, 2);
            }
        }
        Ok(out)
    }
}

/// Cuts a rewritten plan into a [`StageGraph`].
pub struct StageGraphBuilder<'a> {
    config: &'a Config,
    stages: Vec<StageDescriptor>,
}

impl<'a> StageGraphBuilder<'a> {
    /// Creates a builder naming datasets after `config.job_name`.
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            stages: Vec::new(),
        }
    }

    /// Builds the stage graph of `plan`.
    ///
    /// # Errors
    ///
    /// Returns a plan error if a fragment would hold more than one shuffle
    /// boundary, or a serialization error if a fragment cannot be encoded.
    pub fn build(mut self, plan: &LogicalPlan) -> Result<StageGraph> {
        let terminal = self.stage(plan.root.clone(), true)?;
        debug!("built {} stages, terminal {terminal}", self.stages.len());
        Ok(StageGraph {
            job_name: self.config.job_name.clone(),
            stages: self.stages,
            terminal,
        })
    }

    /// Emits the stage running `root`, after every stage it reads.
    fn stage(&mut self, mut root: LogicalOperator, is_terminal: bool) -> Result<usize> {
        match cut_top_shuffle(&mut root)? {
            Some(shuffle) => self.stage_around(root, shuffle, is_terminal),
            None => self.push_stage(vec![root], None, None, Vec::new(), is_terminal),
        }
    }

    /// Emits the stage consuming `shuffle`, which was cut out of `root`.
    ///
    /// A join is consumed on the map side from the partitioned branch
    /// datasets. Any other shuffle is the stage's own, with `root` as its
    /// reduce side.
    fn stage_around(
        &mut self,
        mut root: LogicalOperator,
        shuffle: ShuffleOp,
        is_terminal: bool,
    ) -> Result<usize> {
        if shuffle.annotation.is_join() {
            let inputs = self.partition_join(shuffle, &mut root)?;
            return self.push_stage(vec![root], None, None, inputs, is_terminal);
        }
        let spec = ShuffleSpec::from_annotation(&shuffle.annotation, self.config);
        let mut inputs = Vec::new();
        let mut map = Vec::with_capacity(shuffle.branches.len());
        for branch in shuffle.branches {
            let (pipeline, reads) = self.branch_pipeline(branch)?;
            inputs.extend(reads);
            map.push(pipeline);
        }
        self.push_stage(map, Some(root), Some(spec), inputs, is_terminal)
    }

    /// Emits one partitioning stage per join branch and points the join's
    /// exchange in `consumer` at their datasets. Returns their sequence
    /// numbers in branch order.
    fn partition_join(
        &mut self,
        shuffle: ShuffleOp,
        consumer: &mut LogicalOperator,
    ) -> Result<Vec<usize>> {
        let spec = ShuffleSpec::from_annotation(&shuffle.annotation, self.config);
        let mut sources = Vec::with_capacity(shuffle.branches.len());
        for branch in shuffle.branches {
            let (pipeline, reads) = self.branch_pipeline(branch)?;
            let seq = self.push_stage(vec![pipeline], None, Some(spec.clone()), reads, false)?;
            sources.push(PartitionedSource {
                seq,
                dataset: temp_dataset_name(&self.config.job_name, seq),
            });
        }
        let inputs = sources.iter().map(|s| s.seq).collect();
        let mut pending = Some(sources);
        attach_sources(consumer, &mut pending);
        if pending.is_some() {
            return Err(PlanError::Malformed("join exchange not found in its consumer".into()).into());
        }
        Ok(inputs)
    }

    /// Prepares a shuffle branch for a map side. Returns the pipeline and the
    /// stages it reads.
    ///
    /// A branch without boundaries runs as is, and a branch topped by a join
    /// merges the join's partitions. Any other boundary moves to a stage of
    /// its own whose dataset the branch re-emits.
    fn branch_pipeline(
        &mut self,
        mut branch: LogicalOperator,
    ) -> Result<(LogicalOperator, Vec<usize>)> {
        if !branch.contains_shuffle() {
            return Ok((branch, Vec::new()));
        }
        let (schema, tag) = match &branch {
            LogicalOperator::PhaseOut(out) => (out.schema.clone(), out.tag),
            other => {
                return Err(PlanError::Malformed(format!(
                    "shuffle branch is rooted at {}, not a phase-out",
                    other.name()
                ))
                .into());
            }
        };
        let Some(shuffle) = cut_top_shuffle(&mut branch)? else {
            return Ok((branch, Vec::new()));
        };
        if shuffle.annotation.is_join() {
            let inputs = self.partition_join(shuffle, &mut branch)?;
            return Ok((branch, inputs));
        }
        let seq = self.stage_around(branch, shuffle, false)?;
        let identity = LogicalOperator::PhaseOut(PhaseOutOp {
            input: Box::new(LogicalOperator::StageInput(StageInputOp {
                seq,
                dataset: temp_dataset_name(&self.config.job_name, seq),
                schema: schema.clone(),
                tag,
            })),
            tag,
            schema,
        });
        Ok((identity, vec![seq]))
    }

    fn push_stage(
        &mut self,
        map: Vec<LogicalOperator>,
        reduce: Option<LogicalOperator>,
        shuffle: Option<ShuffleSpec>,
        inputs: Vec<usize>,
        is_terminal: bool,
    ) -> Result<usize> {
        let seq = self.stages.len();
        let output = if is_terminal {
            StageOutput::Collect
        } else {
            StageOutput::Dataset(temp_dataset_name(&self.config.job_name, seq))
        };
        let fragment = StageFragment { map, reduce };
        let bytes = bincode::serde::encode_to_vec(&fragment, bincode::config::standard())
            .map_err(|e| Error::Serialization(format!("stage {seq}: {e}")))?;
        debug!("stage {seq}: {} map pipelines, inputs {inputs:?}, output {output}", fragment.map.len());
        self.stages.push(StageDescriptor {
            seq,
            fragment: bytes,
            inputs,
            shuffle,
            output,
            is_terminal,
        });
        Ok(seq)
    }
}

/// Replaces the topmost shuffle of `op` with an exchange and returns it.
fn cut_top_shuffle(op: &mut LogicalOperator) -> Result<Option<ShuffleOp>> {
    if let LogicalOperator::Shuffle(shuffle) = op {
        let cut = ShuffleOp {
            branches: std::mem::take(&mut shuffle.branches),
            annotation: shuffle.annotation.clone(),
        };
        *op = LogicalOperator::Exchange(ExchangeOp {
            annotation: cut.annotation.clone(),
            sources: Vec::new(),
        });
        return Ok(Some(cut));
    }
    let mut found = None;
    for child in op.children_mut() {
        if let Some(shuffle) = cut_top_shuffle(child)? {
            if found.is_some() {
                return Err(PlanError::Malformed(
                    "a fragment may read at most one shuffle".into(),
                )
                .into());
            }
            found = Some(shuffle);
        }
    }
    Ok(found)
}

/// Hands `sources` to the first join exchange in `op` that has none.
fn attach_sources(op: &mut LogicalOperator, sources: &mut Option<Vec<PartitionedSource>>) {
    if let LogicalOperator::Exchange(exchange) = op {
        if exchange.annotation.is_join() && !exchange.is_merged() {
            if let Some(sources) = sources.take() {
                exchange.sources = sources;
            }
        }
        return;
    }
    for child in op.children_mut() {
        if sources.is_none() {
            return;
        }
        attach_sources(child, sources);
    }
}
