//! Execution of a single map or reduce task.

use std::sync::Arc;

use sluice_adapters::storage::{DatasetReader, DatasetStore};
use sluice_common::types::Record;
use sluice_common::utils::error::{PlanError, Result};
use sluice_core::execution::operators::collect_records;
use sluice_core::execution::source::SourceCatalog;
use sluice_core::shuffle::{PairReader, PairWriter, PartitionedOutput, PhaseOutWriter};
use tracing::debug;

use crate::config::Config;
use crate::query::plan::{LogicalOperator, PhaseOutOp};
use crate::query::planner::{PhysicalPlanner, TaskInput};

/// Shared state every task of a query reads.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    /// Collections scans resolve against.
    pub catalog: &'a dyn SourceCatalog,
    /// Engine configuration.
    pub config: &'a Config,
    /// Intermediate datasets.
    pub store: &'a DatasetStore,
}

/// Where a task's records go.
#[derive(Debug)]
pub enum TaskSink {
    /// The map side of the stage's shuffle.
    Shuffle(PartitionedOutput),
    /// One part of the stage's output dataset.
    Dataset {
        /// Dataset name.
        name: String,
        /// Part number.
        part: usize,
    },
    /// Rows returned to the caller.
    Collect,
}

/// What a finished task produced.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Partitioned pairs for the exchange.
    Shuffled(PartitionedOutput),
    /// Frames written to a dataset part.
    Written(u64),
    /// Result rows.
    Rows(Vec<Record>),
}

/// Runs `pipeline` over `input` into `sink`.
///
/// A pipeline rooted at a phase-out writes encoded pairs; any other pipeline
/// produces rows.
///
/// # Errors
///
/// Returns the first planning, execution, codec or I/O error.
pub fn run_task(
    ctx: TaskContext<'_>,
    pipeline: &LogicalOperator,
    input: TaskInput,
    sink: TaskSink,
) -> Result<TaskOutcome> {
    match (pipeline, sink) {
        (LogicalOperator::PhaseOut(out), TaskSink::Shuffle(mut output)) => {
            let written = write_pairs(ctx, out, input, &mut output)?;
            debug!("task shuffled {written} pairs");
            Ok(TaskOutcome::Shuffled(output))
        }
        (LogicalOperator::PhaseOut(out), TaskSink::Dataset { name, part }) => {
            let mut writer = ctx.store.create_part(&name, part)?;
            write_pairs(ctx, out, input, &mut writer)?;
            let frames = writer.finish()?;
            debug!("task wrote {frames} frames to {name} part {part}");
            Ok(TaskOutcome::Written(frames))
        }
        (LogicalOperator::PhaseOut(_), TaskSink::Collect) => Err(PlanError::Malformed(
            "a terminal pipeline cannot end in a phase-out".into(),
        )
        .into()),
        (_, TaskSink::Collect) => {
            let mut planner = PhysicalPlanner::new(ctx.catalog, ctx.config, input);
            let mut root = planner.plan(pipeline)?;
            let rows = collect_records(root.as_mut())?;
            debug!("task collected {} rows", rows.len());
            Ok(TaskOutcome::Rows(rows))
        }
        (other, _) => Err(PlanError::Malformed(format!(
            "pipeline rooted at {} has no pairs to write",
            other.name()
        ))
        .into()),
    }
}

/// Returns true if the branch can be served by copying its input's pairs.
///
/// That holds when the branch re-emits a dataset that was encoded with the
/// same schema and tag it would encode with itself.
#[must_use]
pub fn is_identity_branch(out: &PhaseOutOp) -> bool {
    match out.input.as_ref() {
        LogicalOperator::StageInput(input) => input.schema == out.schema && input.tag == out.tag,
        _ => false,
    }
}

fn write_pairs(
    ctx: TaskContext<'_>,
    out: &PhaseOutOp,
    input: TaskInput,
    sink: &mut dyn PairWriter,
) -> Result<usize> {
    if ctx.config.raw_identity_mapper && is_identity_branch(out) {
        if let TaskInput::DatasetPart(path) = &input {
            let mut reader = DatasetReader::open(path)?;
            let mut copied = 0;
            while let Some(pair) = reader.next_pair()? {
                sink.write_pair(&pair.key, &pair.value)?;
                copied += 1;
            }
            return Ok(copied);
        }
    }
    let writer = PhaseOutWriter::new(Arc::new(out.schema.clone()), out.tag)?;
    let mut planner = PhysicalPlanner::new(ctx.catalog, ctx.config, input);
    let mut root = planner.plan(&out.input)?;
    writer.drain(root.as_mut(), sink)
}
