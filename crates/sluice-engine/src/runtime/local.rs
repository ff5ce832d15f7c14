//! In-process execution substrate.
//!
//! Runs a [`StageGraph`] on the local machine: stages run in waves of
//! independent stages, tasks within a stage run on the rayon pool, shuffles
//! go through an in-memory [`Exchange`] and intermediate datasets live under
//! the configured work directory. Join branches are partitioned into one
//! dataset part per partition; the consuming stage merges matching parts.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use sluice_adapters::storage::{DatasetReader, DatasetStore};
use sluice_common::types::Record;
use sluice_common::utils::error::{Error, Result};
use sluice_core::execution::source::SourceCatalog;
use sluice_core::shuffle::{
    DeliveryMode, DiagnosticPolicy, Exchange, MergePairReader, OrderCheck, PairReader, PairWriter,
    PartitionedOutput, PolicyKind, ShufflePair, ShufflePolicy, VecPairReader,
};
use tracing::{debug, info};

use super::task::{TaskContext, TaskOutcome, TaskSink, run_task};
use crate::config::Config;
use crate::query::plan::{ExchangeOp, LogicalOperator, StageInputOp};
use crate::query::planner::{TaskInput, driving_scan};
use crate::query::stages::{ShuffleSpec, StageDescriptor, StageGraph, StageOutput};

/// Runs stage graphs in this process.
pub struct LocalSubstrate<'a> {
    config: &'a Config,
    catalog: &'a dyn SourceCatalog,
    store: DatasetStore,
    completed: Mutex<HashSet<usize>>,
}

impl<'a> LocalSubstrate<'a> {
    /// Creates a substrate keeping datasets under `config.work_dir`.
    pub fn new(config: &'a Config, catalog: &'a dyn SourceCatalog) -> Self {
        Self {
            config,
            catalog,
            store: DatasetStore::new(&config.work_dir),
            completed: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the dataset store.
    #[must_use]
    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Runs every stage of `graph` and returns the terminal stage's rows.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage's error, wrapped with its sequence
    /// number.
    pub fn run(&self, graph: &StageGraph) -> Result<Vec<Record>> {
        info!("running job {} with {} stages", graph.job_name, graph.len());
        let mut rows = Vec::new();
        for wave in graph.waves() {
            let results = wave
                .par_iter()
                .map(|&seq| {
                    let stage = graph.stage(seq).ok_or_else(|| {
                        Error::Internal(format!("stage graph has no stage {seq}"))
                    })?;
                    self.run_stage(stage)
                })
                .collect::<Result<Vec<_>>>()?;
            for stage_rows in results.into_iter().flatten() {
                rows.extend(stage_rows);
            }
        }
        info!("job {} produced {} rows", graph.job_name, rows.len());
        Ok(rows)
    }

    /// Runs one stage. Returns its rows if it collects output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stage`] if an input stage has not completed, or the
    /// stage's own failure wrapped with its sequence number.
    pub fn run_stage(&self, stage: &StageDescriptor) -> Result<Option<Vec<Record>>> {
        let missing: Vec<usize> = {
            let completed = self.completed.lock();
            stage
                .inputs
                .iter()
                .copied()
                .filter(|i| !completed.contains(i))
                .collect()
        };
        if !missing.is_empty() {
            return Err(Error::Stage {
                seq: stage.seq,
                message: format!("input stages {missing:?} have not completed"),
            });
        }

        info!("stage {} started", stage.seq);
        let rows = self.execute(stage).map_err(|e| e.in_stage(stage.seq))?;
        self.completed.lock().insert(stage.seq);
        info!("stage {} completed", stage.seq);
        Ok(rows)
    }

    fn execute(&self, stage: &StageDescriptor) -> Result<Option<Vec<Record>>> {
        if let StageOutput::Dataset(name) = &stage.output {
            self.store.prepare(name, self.config.delete_existing)?;
        }
        let fragment = stage.fragment()?;
        let ctx = TaskContext {
            catalog: self.catalog,
            config: self.config,
            store: &self.store,
        };

        let mut tasks = Vec::new();
        for pipeline in &fragment.map {
            for input in self.map_inputs(pipeline)? {
                tasks.push((pipeline, input));
            }
        }
        debug!("stage {}: {} map tasks", stage.seq, tasks.len());

        let sink = |part: usize| match &stage.output {
            StageOutput::Dataset(name) => TaskSink::Dataset {
                name: name.clone(),
                part,
            },
            StageOutput::Collect => TaskSink::Collect,
        };

        match (&stage.shuffle, &fragment.reduce) {
            (Some(spec), Some(reduce)) => {
                let declared = spec.policy.build();
                let outcomes = tasks
                    .into_par_iter()
                    .map(|(pipeline, input)| {
                        let output = PartitionedOutput::new(declared.clone(), spec.partitions);
                        run_task(ctx, pipeline, input, TaskSink::Shuffle(output))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let delivered = self.exchange(spec, &declared, outcomes)?;
                let check = self.order_check(spec, &declared);
                let outcomes = delivered
                    .into_par_iter()
                    .enumerate()
                    .map(|(part, pairs)| {
                        debug!("stage {} partition {part}: {} pairs", stage.seq, pairs.len());
                        let input = TaskInput::Partition {
                            reader: Box::new(VecPairReader::new(pairs)),
                            check: check.clone(),
                        };
                        run_task(ctx, reduce, input, sink(part))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(collect_rows(stage, outcomes))
            }
            (Some(spec), None) => {
                let StageOutput::Dataset(name) = &stage.output else {
                    return Err(Error::Internal(format!(
                        "partitioning stage {} has no dataset to write",
                        stage.seq
                    )));
                };
                let declared = spec.policy.build();
                let outcomes = tasks
                    .into_par_iter()
                    .map(|(pipeline, input)| {
                        let output = PartitionedOutput::new(declared.clone(), spec.partitions);
                        run_task(ctx, pipeline, input, TaskSink::Shuffle(output))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let delivered = self.exchange(spec, &declared, outcomes)?;
                delivered
                    .into_par_iter()
                    .enumerate()
                    .map(|(part, pairs)| self.write_part(name, part, pairs))
                    .collect::<Result<Vec<_>>>()?;
                Ok(None)
            }
            (None, None) => {
                let outcomes = tasks
                    .into_par_iter()
                    .enumerate()
                    .map(|(part, (pipeline, input))| run_task(ctx, pipeline, input, sink(part)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(collect_rows(stage, outcomes))
            }
            (None, Some(_)) => Err(Error::Internal(format!(
                "stage {} has a reduce side without a shuffle",
                stage.seq
            ))),
        }
    }

    /// One input per map task of `pipeline`.
    fn map_inputs(&self, pipeline: &LogicalOperator) -> Result<Vec<TaskInput>> {
        if let Some(exchange) = merged_exchange(pipeline) {
            return self.merged_partitions(exchange);
        }
        if let Some(input) = stage_input(pipeline) {
            let parts = self.store.parts(&input.dataset)?;
            return Ok(parts.into_iter().map(TaskInput::DatasetPart).collect());
        }
        let Some(scan) = driving_scan(pipeline) else {
            return Ok(vec![TaskInput::Empty]);
        };
        let source = self
            .catalog
            .resolve(&scan.collection)
            .ok_or_else(|| Error::Source(format!("unknown collection {}", scan.collection)))?;
        let splits = source.splits(self.config.map_tasks)?;
        if splits.is_empty() {
            return Ok(vec![TaskInput::Empty]);
        }
        Ok(splits.into_iter().map(TaskInput::Source).collect())
    }

    /// One input per join partition: part `p` of every branch dataset,
    /// merged in join order.
    fn merged_partitions(&self, exchange: &ExchangeOp) -> Result<Vec<TaskInput>> {
        let spec = ShuffleSpec::from_annotation(&exchange.annotation, self.config);
        let declared = spec.policy.build();
        let branches = exchange
            .sources
            .iter()
            .map(|source| self.store.parts(&source.dataset))
            .collect::<Result<Vec<_>>>()?;
        let counts: Vec<usize> = branches.iter().map(Vec::len).collect();
        let partitions = counts.first().copied().unwrap_or(0);
        if counts.iter().any(|&c| c != partitions) {
            return Err(Error::Internal(format!(
                "join branches were written with {counts:?} parts"
            )));
        }
        let check = self.order_check(&spec, &declared);
        (0..partitions)
            .map(|part| {
                let readers = branches
                    .iter()
                    .map(|parts| {
                        let reader: Box<dyn PairReader> = Box::new(DatasetReader::open(&parts[part])?);
                        Ok(reader)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(TaskInput::Partition {
                    reader: Box::new(MergePairReader::new(declared.clone(), readers)),
                    check: check.clone(),
                })
            })
            .collect()
    }

    fn write_part(&self, name: &str, part: usize, pairs: Vec<ShufflePair>) -> Result<u64> {
        let mut writer = self.store.create_part(name, part)?;
        for pair in &pairs {
            writer.write_pair(&pair.key, &pair.value)?;
        }
        let frames = writer.finish()?;
        debug!("partition {part} of {name}: {frames} frames");
        Ok(frames)
    }

    fn exchange(
        &self,
        spec: &ShuffleSpec,
        declared: &Arc<dyn ShufflePolicy>,
        outcomes: Vec<TaskOutcome>,
    ) -> Result<Vec<Vec<ShufflePair>>> {
        let (delivery, mode): (Arc<dyn ShufflePolicy>, DeliveryMode) =
            match self.config.diagnostic_order {
                Some(order) => (
                    Arc::new(DiagnosticPolicy::new(declared.clone(), order)),
                    DeliveryMode::Sort,
                ),
                None if spec.skip_sort => (declared.clone(), DeliveryMode::MergeRuns),
                None => (declared.clone(), DeliveryMode::Sort),
            };
        let mut exchange = Exchange::new(delivery, spec.partitions);
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Shuffled(output) => exchange.add_output(output)?,
                other => {
                    return Err(Error::Internal(format!(
                        "map task of a shuffle stage returned {other:?}"
                    )));
                }
            }
        }
        Ok(exchange.deliver(mode))
    }

    fn order_check(&self, spec: &ShuffleSpec, declared: &Arc<dyn ShufflePolicy>) -> Option<OrderCheck> {
        let is_join = matches!(spec.policy, PolicyKind::Join { .. });
        (self.config.validate_delivery_order && (spec.skip_sort || is_join))
            .then(|| OrderCheck::new(declared.clone(), is_join))
    }
}

fn merged_exchange(op: &LogicalOperator) -> Option<&ExchangeOp> {
    match op {
        LogicalOperator::Exchange(exchange) if exchange.is_merged() => Some(exchange),
        other => other.children().into_iter().find_map(merged_exchange),
    }
}

fn stage_input(op: &LogicalOperator) -> Option<&StageInputOp> {
    match op {
        LogicalOperator::StageInput(input) => Some(input),
        other => other.children().into_iter().find_map(stage_input),
    }
}

fn collect_rows(stage: &StageDescriptor, outcomes: Vec<TaskOutcome>) -> Option<Vec<Record>> {
    if stage.output != StageOutput::Collect {
        return None;
    }
    let mut rows = Vec::new();
    for outcome in outcomes {
        if let TaskOutcome::Rows(part) = outcome {
            rows.extend(part);
        }
    }
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::query::plan::{JoinOp, LogicalPlan, OrderByOp, OrderSpec, ScanOp, StartOp};
    use crate::query::rewriter::PlanRewriter;
    use crate::query::stages::StageGraphBuilder;
    use sluice_adapters::source::RangeSource;
    use sluice_common::types::{LogicalType, Value};
    use sluice_core::execution::ScalarExpr;
    use sluice_core::execution::source::FieldDef;

    fn setup() -> (tempfile::TempDir, Config, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_work_dir(dir.path()).with_map_tasks(3);
        let catalog = Catalog::new();
        catalog
            .register(Arc::new(RangeSource::new("numbers", 0, 20).unwrap()))
            .unwrap();
        (dir, config, catalog)
    }

    fn numbers() -> LogicalOperator {
        LogicalOperator::Scan(ScanOp {
            input: Box::new(LogicalOperator::Start(StartOp::default())),
            collection: "numbers".into(),
            fields: vec![FieldDef::new("value", LogicalType::Int64)],
            predicates: Vec::new(),
        })
    }

    fn descending() -> LogicalPlan {
        LogicalPlan::new(LogicalOperator::OrderBy(OrderByOp {
            input: Box::new(numbers()),
            keys: vec![OrderSpec::descending(0)],
            local: false,
        }))
    }

    #[test]
    fn test_descending_order_across_map_tasks() {
        let (_dir, config, catalog) = setup();
        let plan = PlanRewriter::default().rewrite(descending()).unwrap();
        let graph = StageGraphBuilder::new(&config).build(&plan).unwrap();
        let rows = LocalSubstrate::new(&config, &catalog).run(&graph).unwrap();
        let values: Vec<i64> = rows
            .iter()
            .map(|r| match r.get(0) {
                Some(Value::Int64(v)) => *v,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, (0..20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_join_branches_write_one_part_per_partition() {
        let (_dir, config, catalog) = setup();
        let config = config.with_reduce_partitions(4).with_job_name("self_join");
        let plan = LogicalPlan::new(LogicalOperator::Join(JoinOp {
            left: Box::new(numbers()),
            right: Box::new(numbers()),
            left_key: ScalarExpr::slot(0),
            right_key: ScalarExpr::slot(0),
        }));
        let graph = StageGraphBuilder::new(&config)
            .build(&PlanRewriter::default().rewrite(plan).unwrap())
            .unwrap();
        let substrate = LocalSubstrate::new(&config, &catalog);
        let rows = substrate.run(&graph).unwrap();
        assert_eq!(rows.len(), 20);
        assert!(rows.iter().all(|r| r.width() == 2 && r.get(0) == r.get(1)));
        for seq in [0, 1] {
            let parts = substrate.store().parts(&format!("self_join_temp_{seq}")).unwrap();
            assert_eq!(parts.len(), 4);
        }
    }

    #[test]
    fn test_stage_with_pending_input_is_refused() {
        let (_dir, config, catalog) = setup();
        let mut graph = StageGraphBuilder::new(&config)
            .build(&PlanRewriter::default().rewrite(descending()).unwrap())
            .unwrap();
        graph.stages[0].inputs.push(7);
        let substrate = LocalSubstrate::new(&config, &catalog);
        assert!(matches!(
            substrate.run_stage(&graph.stages[0]),
            Err(Error::Stage { seq: 0, .. })
        ));
    }
}
