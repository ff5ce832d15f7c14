//! Physical planning of stage fragments.
//!
//! Turns one pipeline of a [`StageFragment`](super::stages::StageFragment)
//! into a tree of pull-based operators for a single task. The task's input
//! (a source split, a dataset part, or a delivered partition) is handed to
//! the first operator that reads it.

use std::path::PathBuf;
use std::sync::Arc;

use sluice_adapters::storage::DatasetReader;
use sluice_common::utils::error::{Error, PlanError, Result};
use sluice_core::execution::operators::{
    FilterOperator, GroupByOperator, LetOperator, LocalHashJoin, Operator, ProjectOperator,
    ScanOperator, SortKey, SortOperator, StartOperator, StreamOpener, StreamingHashJoin,
    StreamingJoinConfig,
};
use sluice_core::execution::source::{
    RecordSource, RecordStream, ScanRequest, SourceCatalog, SourceSplit,
};
use sluice_core::shuffle::{
    OrderCheck, PairReader, PhaseInOperator, PhaseInReader, TaggedPhaseIn,
};
use tracing::debug;

use super::plan::{JoinOp, LogicalOperator, ScanOp, ShuffleAnnotation};
use super::schema::{key_slots, output_types};
use crate::config::Config;

/// What one task reads.
pub enum TaskInput {
    /// One split of the pipeline's driving scan.
    Source(SourceSplit),
    /// One part file of an earlier stage's dataset.
    DatasetPart(PathBuf),
    /// The delivered partition of the stage's own shuffle.
    Partition {
        /// Delivered pairs.
        reader: Box<dyn PairReader>,
        /// Delivery-order check, if enabled.
        check: Option<OrderCheck>,
    },
    /// Nothing beyond what the pipeline opens itself.
    Empty,
}

impl std::fmt::Debug for TaskInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(split) => f.debug_tuple("Source").field(split).finish(),
            Self::DatasetPart(path) => f.debug_tuple("DatasetPart").field(path).finish(),
            Self::Partition { check, .. } => f
                .debug_struct("Partition")
                .field("checked", &check.is_some())
                .finish(),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// Builds the operator tree of one task.
pub struct PhysicalPlanner<'a> {
    catalog: &'a dyn SourceCatalog,
    config: &'a Config,
    input: TaskInput,
}

impl<'a> PhysicalPlanner<'a> {
    /// Creates a planner handing `input` to the first operator that reads it.
    pub fn new(catalog: &'a dyn SourceCatalog, config: &'a Config, input: TaskInput) -> Self {
        Self {
            catalog,
            config,
            input,
        }
    }

    /// Plans `op` and everything below it.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown collections, field type disagreements,
    /// unstaged shuffle nodes, or missing task input.
    pub fn plan(&mut self, op: &LogicalOperator) -> Result<Box<dyn Operator>> {
        match op {
            LogicalOperator::Start(start) => Ok(Box::new(StartOperator::new(start.prefilled.len()))),
            LogicalOperator::Scan(scan) => {
                let child = self.plan(&scan.input)?;
                let opener = self.opener(scan)?;
                Ok(Box::new(ScanOperator::new(child, opener)))
            }
            LogicalOperator::Let(bind) => {
                let child = self.plan(&bind.input)?;
                Ok(Box::new(LetOperator::new(child, bind.expression.clone())))
            }
            LogicalOperator::Filter(filter) => {
                let child = self.plan(&filter.input)?;
                Ok(Box::new(FilterOperator::new(child, filter.predicate.clone())))
            }
            LogicalOperator::OrderBy(order) => {
                let keys = order
                    .keys
                    .iter()
                    .map(|spec| {
                        let slot = spec
                            .expression
                            .as_slot()
                            .ok_or(PlanError::NonVariableKey { site: "order-by" })?;
                        Ok(SortKey {
                            slot,
                            direction: spec.direction,
                            nulls: spec.nulls,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let child = self.plan(&order.input)?;
                Ok(Box::new(SortOperator::new(child, keys)))
            }
            LogicalOperator::GroupBy(group) => {
                let keys = key_slots(&group.keys, "group-by")?;
                let input_width = output_types(&group.input)?.len();
                let child = self.plan(&group.input)?;
                Ok(Box::new(GroupByOperator::new(
                    child,
                    keys,
                    group.aggregates.clone(),
                    group.phase,
                    group.mode,
                    input_width,
                )))
            }
            LogicalOperator::Join(join) => self.local_join(join),
            LogicalOperator::Return(ret) => {
                let child = self.plan(&ret.input)?;
                let projections = ret.columns.iter().map(|c| c.expression.clone()).collect();
                Ok(Box::new(ProjectOperator::new(child, projections)))
            }
            LogicalOperator::PhaseIn(phase_in) => {
                let annotation = exchange_annotation(&phase_in.input)?;
                if annotation.is_join() {
                    return Err(PlanError::Malformed(
                        "tagged join records can only be consumed by a post join".into(),
                    )
                    .into());
                }
                let reader = self.partition_reader(annotation)?;
                Ok(Box::new(PhaseInOperator::new(reader)))
            }
            LogicalOperator::PostJoin(join) => {
                let LogicalOperator::PhaseIn(phase_in) = join.input.as_ref() else {
                    return Err(PlanError::Malformed("post join must read a phase-in".into()).into());
                };
                let annotation = exchange_annotation(&phase_in.input)?;
                let reader = self.partition_reader(annotation)?;
                let config = StreamingJoinConfig {
                    table_size: self.config.hash_table_size,
                    bucket_capacity: self.config.hash_bucket_size,
                    compute_stats: self.config.compute_hash_table_stats,
                };
                Ok(Box::new(StreamingHashJoin::new(
                    Box::new(TaggedPhaseIn::new(reader)),
                    join.probe_key,
                    join.build_key,
                    config,
                )))
            }
            LogicalOperator::StageInput(input) => {
                let TaskInput::DatasetPart(path) = self.take_input() else {
                    return Err(Error::Internal(format!(
                        "no dataset part assigned for input of stage {}",
                        input.seq
                    )));
                };
                debug!("reading {} part {}", input.dataset, path.display());
                let reader = PhaseInReader::new(
                    Box::new(DatasetReader::open(&path)?),
                    Arc::new(input.schema.clone()),
                );
                Ok(Box::new(PhaseInOperator::new(reader)))
            }
            LogicalOperator::PhaseOut(_)
            | LogicalOperator::Shuffle(_)
            | LogicalOperator::Exchange(_) => Err(PlanError::Malformed(format!(
                "{} cannot be planned inside a pipeline",
                op.name()
            ))
            .into()),
        }
    }

    fn take_input(&mut self) -> TaskInput {
        std::mem::replace(&mut self.input, TaskInput::Empty)
    }

    fn partition_reader(&mut self, annotation: &ShuffleAnnotation) -> Result<PhaseInReader> {
        let TaskInput::Partition { reader, check } = self.take_input() else {
            return Err(Error::Internal(format!(
                "no partition assigned for the {} exchange",
                annotation.site
            )));
        };
        let reader = PhaseInReader::new(reader, Arc::new(annotation.schema.clone()));
        Ok(match check {
            Some(check) => reader.with_order_check(check),
            None => reader,
        })
    }

    fn opener(&mut self, scan: &ScanOp) -> Result<StreamOpener> {
        let source = self
            .catalog
            .resolve(&scan.collection)
            .ok_or_else(|| Error::Source(format!("unknown collection {}", scan.collection)))?;
        check_fields(scan, source.as_ref())?;
        let request = ScanRequest {
            fields: scan.fields.iter().map(|f| f.name.clone()).collect(),
            predicates: scan.predicates.clone(),
        };

        let split = match self.take_input() {
            TaskInput::Source(split) if split.source == scan.collection => Some(split),
            other => {
                self.input = other;
                None
            }
        };
        Ok(match split {
            Some(split) => Box::new(move || source.open(&split, &request)),
            None => Box::new(move || open_all(source.as_ref(), &request)),
        })
    }

    /// Plans a join evaluated inside the task. Key expressions that are not
    /// slot references are bound to a trailing slot on each side and
    /// projected away after the join.
    fn local_join(&mut self, join: &JoinOp) -> Result<Box<dyn Operator>> {
        let left_width = output_types(&join.left)?.len();
        let right_width = output_types(&join.right)?.len();
        let mut left = self.plan(&join.left)?;
        let mut right = self.plan(&join.right)?;

        let (left_key, left_bound) = match join.left_key.as_slot() {
            Some(slot) => (slot, false),
            None => {
                left = Box::new(LetOperator::new(left, join.left_key.clone()));
                (left_width, true)
            }
        };
        let (right_key, right_bound) = match join.right_key.as_slot() {
            Some(slot) => (slot, false),
            None => {
                right = Box::new(LetOperator::new(right, join.right_key.clone()));
                (right_width, true)
            }
        };
        let joined: Box<dyn Operator> =
            Box::new(LocalHashJoin::new(left, right, left_key, right_key));
        if !left_bound && !right_bound {
            return Ok(joined);
        }
        let right_start = left_width + usize::from(left_bound);
        let keep = (0..left_width)
            .chain(right_start..right_start + right_width)
            .collect();
        Ok(Box::new(ProjectOperator::select_slots(joined, keep)))
    }
}

/// Returns the scan whose splits drive a pipeline: the first scan planned,
/// which is the innermost one of the leftmost input.
#[must_use]
pub fn driving_scan(op: &LogicalOperator) -> Option<&ScanOp> {
    for child in op.children() {
        if let Some(scan) = driving_scan(child) {
            return Some(scan);
        }
    }
    match op {
        LogicalOperator::Scan(scan) => Some(scan),
        _ => None,
    }
}

fn exchange_annotation(op: &LogicalOperator) -> Result<&ShuffleAnnotation> {
    match op {
        LogicalOperator::Exchange(exchange) => Ok(&exchange.annotation),
        LogicalOperator::Shuffle(_) => Err(PlanError::Malformed(
            "shuffle must be cut into stages before planning".into(),
        )
        .into()),
        other => Err(PlanError::Malformed(format!("phase-in reads {}", other.name())).into()),
    }
}

fn check_fields(scan: &ScanOp, source: &dyn RecordSource) -> Result<()> {
    for field in &scan.fields {
        let declared = source
            .fields()
            .iter()
            .find(|f| f.name == field.name)
            .ok_or_else(|| {
                Error::Source(format!(
                    "collection {} has no field {}",
                    scan.collection, field.name
                ))
            })?;
        if declared.ty != field.ty {
            return Err(PlanError::TypeMismatch {
                expected: format!("{}.{} as {}", scan.collection, field.name, declared.ty),
                found: field.ty.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn open_all(source: &dyn RecordSource, request: &ScanRequest) -> Result<RecordStream> {
    let streams = source
        .splits(1)?
        .iter()
        .map(|split| source.open(split, request))
        .collect::<Result<Vec<_>>>()?;
    Ok(Box::new(streams.into_iter().flatten()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::query::plan::{JoinOp, ReturnColumn, ReturnOp, StartOp};
    use sluice_adapters::source::MemorySource;
    use sluice_common::types::{LogicalType, Record, Value};
    use sluice_core::execution::operators::collect_records;
    use sluice_core::execution::source::FieldDef;
    use sluice_core::execution::{BinaryOp, ScalarExpr};

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        let fields = vec![
            FieldDef::new("id", LogicalType::Int64),
            FieldDef::new("name", LogicalType::String),
        ];
        let rows = vec![
            Record::new(vec![Value::Int64(1), Value::from("a")]),
            Record::new(vec![Value::Int64(2), Value::from("b")]),
        ];
        catalog
            .register(Arc::new(MemorySource::new("items", fields, rows).unwrap()))
            .unwrap();
        catalog
    }

    fn scan(fields: Vec<FieldDef>) -> LogicalOperator {
        LogicalOperator::Scan(ScanOp {
            input: Box::new(LogicalOperator::Start(StartOp::default())),
            collection: "items".into(),
            fields,
            predicates: Vec::new(),
        })
    }

    #[test]
    fn test_scan_and_return() {
        let catalog = catalog();
        let config = Config::default();
        let plan = LogicalOperator::Return(ReturnOp {
            input: Box::new(scan(vec![FieldDef::new("name", LogicalType::String)])),
            columns: vec![ReturnColumn::slot("name", 0)],
        });
        let mut planner = PhysicalPlanner::new(&catalog, &config, TaskInput::Empty);
        let mut op = planner.plan(&plan).unwrap();
        let rows = collect_records(op.as_mut()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0), Some(&Value::from("b")));
    }

    #[test]
    fn test_field_type_mismatch() {
        let catalog = catalog();
        let config = Config::default();
        let plan = scan(vec![FieldDef::new("id", LogicalType::String)]);
        let mut planner = PhysicalPlanner::new(&catalog, &config, TaskInput::Empty);
        assert!(matches!(planner.plan(&plan), Err(Error::Plan(_))));
        let missing = scan(vec![FieldDef::new("price", LogicalType::Int64)]);
        assert!(matches!(planner.plan(&missing), Err(Error::Source(_))));
    }

    #[test]
    fn test_local_join_with_computed_key() {
        let catalog = catalog();
        let config = Config::default();
        let fields = || vec![FieldDef::new("id", LogicalType::Int64)];
        let plan = LogicalOperator::Join(JoinOp {
            left: Box::new(scan(fields())),
            right: Box::new(scan(fields())),
            left_key: ScalarExpr::binary(ScalarExpr::slot(0), BinaryOp::Add, ScalarExpr::literal(1i64)),
            right_key: ScalarExpr::slot(0),
        });
        let mut planner = PhysicalPlanner::new(&catalog, &config, TaskInput::Empty);
        let mut op = planner.plan(&plan).unwrap();
        let rows = collect_records(op.as_mut()).unwrap();
        assert_eq!(rows, vec![Record::new(vec![Value::Int64(1), Value::Int64(2)])]);
    }

    #[test]
    fn test_unstaged_shuffle_is_rejected() {
        let catalog = catalog();
        let config = Config::default();
        let plan = crate::query::rewriter::PlanRewriter::default()
            .rewrite(crate::query::plan::LogicalPlan::new(LogicalOperator::OrderBy(
                crate::query::plan::OrderByOp {
                    input: Box::new(scan(vec![FieldDef::new("id", LogicalType::Int64)])),
                    keys: vec![crate::query::plan::OrderSpec::ascending(0)],
                    local: false,
                },
            )))
            .unwrap();
        let mut planner = PhysicalPlanner::new(&catalog, &config, TaskInput::Empty);
        assert!(planner.plan(&plan.root).is_err());
    }

    #[test]
    fn test_driving_scan_is_leftmost() {
        let left = scan(vec![FieldDef::new("id", LogicalType::Int64)]);
        let plan = LogicalOperator::Join(JoinOp {
            left: Box::new(left),
            right: Box::new(LogicalOperator::Start(StartOp::default())),
            left_key: ScalarExpr::slot(0),
            right_key: ScalarExpr::slot(0),
        });
        assert_eq!(driving_scan(&plan).map(|s| s.collection.as_str()), Some("items"));
    }
}
