//! Shuffle rewrite.
//!
//! Splits every distributable site of a logical plan around a shuffle
//! boundary:
//!
//! - **Order-by**: the order-by runs locally, its output is shuffled into a
//!   single partition with pre-sorted runs, and a phase-in passes the merged
//!   records on.
//! - **Group-by**: a partial group-by runs before the shuffle and a final one
//!   merges the partial aggregates after it. `count` becomes a sum over
//!   presence indicators before and a sum of partial counts after.
//! - **Join**: both inputs are shuffled on their key with a branch tag, and a
//!   streaming hash join consumes the tag-ordered delivery.
//!
//! The rewrite is bottom-up and idempotent: sites it produces are marked
//! local or replaced, so rewriting a rewritten plan changes nothing.

use sluice_common::types::LogicalType;
use sluice_common::utils::error::{PlanError, Result};
use sluice_core::execution::operators::{AggregateSpec, GroupMode, GroupPhase, SortKey};
use sluice_core::shuffle::{BranchSchema, BranchTag, ShuffleSchema};
use tracing::{debug, warn};

use super::plan::{
    GroupByOp, JoinOp, LogicalOperator, LogicalPlan, OrderByOp, OrderSpec, PhaseInOp, PhaseOutOp,
    PostJoinOp, ShuffleAnnotation, ShuffleOp, ShuffleSite, StartOp,
};
use super::schema::{check_join_key_types, group_output_types, key_slots, output_types};
use crate::config::GroupingStrategy;

/// The only supported collation.
pub const CODEPOINT_COLLATION: &str = "http://www.w3.org/2005/xpath-functions/collation/codepoint";

/// Rewrites logical plans into staged plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanRewriter {
    strategy: GroupingStrategy,
}

impl PlanRewriter {
    /// Creates a rewriter using `strategy` for group-by sites.
    #[must_use]
    pub fn new(strategy: GroupingStrategy) -> Self {
        Self { strategy }
    }

    /// Rewrites `plan`.
    ///
    /// # Errors
    ///
    /// Returns a plan error for non-variable order-by or group-by keys,
    /// unresolved slots, non-atomic keys, unsupported collations, or
    /// mismatched join key types.
    pub fn rewrite(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        Ok(LogicalPlan::new(self.rewrite_op(plan.root)?))
    }

    fn rewrite_op(&self, mut op: LogicalOperator) -> Result<LogicalOperator> {
        for child in op.children_mut() {
            let taken = std::mem::replace(child, placeholder());
            *child = self.rewrite_op(taken)?;
        }
        match op {
            LogicalOperator::OrderBy(order) if !order.local => self.split_order_by(order),
            LogicalOperator::GroupBy(group) if !group.local => self.split_group_by(group),
            LogicalOperator::Join(join) => self.split_join(join),
            other => Ok(other),
        }
    }

    fn split_order_by(&self, order: OrderByOp) -> Result<LogicalOperator> {
        let types = output_types(&order.input)?;
        let keys = order
            .keys
            .iter()
            .map(|spec| order_key(spec, &types))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!("splitting order-by on slots {:?}", keys.iter().map(|k| k.slot).collect::<Vec<_>>());

        let schema = ShuffleSchema::single(BranchSchema::new(types, keys, prefix_width(&order.input)));
        schema.validate()?;
        let local = LogicalOperator::OrderBy(OrderByOp {
            local: true,
            ..order
        });
        Ok(shuffle_single(local, schema, ShuffleSite::OrderBy, true))
    }

    fn split_group_by(&self, group: GroupByOp) -> Result<LogicalOperator> {
        if group.phase != GroupPhase::Complete {
            return Err(PlanError::Malformed(format!(
                "a {:?} group-by must be marked local",
                group.phase
            ))
            .into());
        }
        let input_types = output_types(&group.input)?;
        let keys = key_slots(&group.keys, "group-by")?;
        let shift = prefix_width(&group.input);

        let (input, mode, sort_keys, skip_sort) = match self.strategy {
            GroupingStrategy::Sort => match existing_order(&group.input, &keys) {
                Some(sort_keys) => {
                    debug!("group-by input is already ordered on {keys:?}");
                    (*group.input, GroupMode::Sequential, sort_keys, true)
                }
                None => {
                    let sort = LogicalOperator::OrderBy(OrderByOp {
                        input: group.input,
                        keys: keys.iter().map(|&k| OrderSpec::ascending(k)).collect(),
                        local: true,
                    });
                    let sort_keys = keys.iter().map(|&k| SortKey::ascending(k)).collect();
                    (sort, GroupMode::Sequential, sort_keys, true)
                }
            },
            GroupingStrategy::Hash => (
                *group.input,
                GroupMode::Hash,
                keys.iter().map(|&k| SortKey::ascending(k)).collect(),
                false,
            ),
        };
        debug!("splitting group-by on slots {keys:?} ({mode:?})");

        let partial_specs: Vec<AggregateSpec> =
            group.aggregates.iter().map(AggregateSpec::partial).collect();
        let merge_specs: Vec<AggregateSpec> =
            group.aggregates.iter().map(AggregateSpec::merge).collect();
        let partial_types = group_output_types(
            &input_types,
            &keys,
            &partial_specs,
            GroupPhase::Partial,
        )?;

        let partial = LogicalOperator::GroupBy(GroupByOp {
            input: Box::new(input),
            keys: group.keys.clone(),
            aggregates: partial_specs,
            phase: GroupPhase::Partial,
            mode,
            local: true,
        });
        let schema = ShuffleSchema::single(BranchSchema::new(partial_types, sort_keys, shift));
        schema.validate()?;
        let phase_in = shuffle_single(partial, schema, ShuffleSite::GroupBy, skip_sort);

        Ok(LogicalOperator::GroupBy(GroupByOp {
            input: Box::new(phase_in),
            keys: group.keys,
            aggregates: merge_specs,
            phase: GroupPhase::Final,
            mode,
            local: true,
        }))
    }

    fn split_join(&self, join: JoinOp) -> Result<LogicalOperator> {
        let (Some(left_key), Some(right_key)) = (join.left_key.as_slot(), join.right_key.as_slot())
        else {
            warn!("join keys are not slot references; the join runs unsplit");
            return Ok(LogicalOperator::Join(join));
        };

        let left_types = output_types(&join.left)?;
        let right_types = output_types(&join.right)?;
        let lt = slot_type(&left_types, left_key)?;
        let rt = slot_type(&right_types, right_key)?;
        check_join_key_types(lt, rt)?;

        let shift = left_types.len();
        let mut right = *join.right;
        shift_plan(&mut right, &left_types);
        let build_key = right_key + shift;
        let build_types = output_types(&right)?;
        debug!("splitting join on slots {left_key} and {right_key} (build slot {build_key})");

        let probe = BranchSchema::new(
            left_types,
            vec![SortKey::ascending(left_key)],
            prefix_width(&join.left),
        );
        let build = BranchSchema::new(
            build_types,
            vec![SortKey::ascending(build_key)],
            prefix_width(&right),
        );
        let schema = ShuffleSchema::join(probe, build);
        schema.validate()?;

        let branches = vec![
            LogicalOperator::PhaseOut(PhaseOutOp {
                input: join.left,
                tag: Some(BranchTag::PROBE),
                schema: schema.clone(),
            }),
            LogicalOperator::PhaseOut(PhaseOutOp {
                input: Box::new(right),
                tag: Some(BranchTag::BUILD),
                schema: schema.clone(),
            }),
        ];
        let shuffle = LogicalOperator::Shuffle(ShuffleOp {
            branches,
            annotation: ShuffleAnnotation {
                site: ShuffleSite::Join,
                schema,
                skip_sort: false,
            },
        });
        Ok(LogicalOperator::PostJoin(PostJoinOp {
            input: Box::new(LogicalOperator::PhaseIn(PhaseInOp {
                input: Box::new(shuffle),
            })),
            probe_key: left_key,
            build_key,
        }))
    }
}

fn placeholder() -> LogicalOperator {
    LogicalOperator::Start(StartOp::default())
}

fn slot_type(types: &[LogicalType], slot: usize) -> std::result::Result<&LogicalType, PlanError> {
    types.get(slot).ok_or(PlanError::UnresolvedSlot {
        slot,
        width: types.len(),
    })
}

fn order_key(spec: &OrderSpec, types: &[LogicalType]) -> std::result::Result<SortKey, PlanError> {
    let slot = spec
        .expression
        .as_slot()
        .ok_or(PlanError::NonVariableKey { site: "order-by" })?;
    if let Some(collation) = &spec.collation {
        if collation != CODEPOINT_COLLATION {
            return Err(PlanError::UnsupportedCollation(collation.clone()));
        }
    }
    slot_type(types, slot)?;
    Ok(SortKey {
        slot,
        direction: spec.direction,
        nulls: spec.nulls,
    })
}

/// Wraps `pre` in a single-branch shuffle and returns the phase-in reading it.
fn shuffle_single(
    pre: LogicalOperator,
    schema: ShuffleSchema,
    site: ShuffleSite,
    skip_sort: bool,
) -> LogicalOperator {
    let phase_out = LogicalOperator::PhaseOut(PhaseOutOp {
        input: Box::new(pre),
        tag: None,
        schema: schema.clone(),
    });
    LogicalOperator::PhaseIn(PhaseInOp {
        input: Box::new(LogicalOperator::Shuffle(ShuffleOp {
            branches: vec![phase_out],
            annotation: ShuffleAnnotation {
                site,
                schema,
                skip_sort,
            },
        })),
    })
}

/// Number of leading slots owned by an enclosing stage in the records `op`
/// produces.
pub(crate) fn prefix_width(op: &LogicalOperator) -> usize {
    match op {
        LogicalOperator::Start(start) => start.prefilled.len(),
        LogicalOperator::Scan(o) => prefix_width(&o.input),
        LogicalOperator::Let(o) => prefix_width(&o.input),
        LogicalOperator::Filter(o) => prefix_width(&o.input),
        LogicalOperator::OrderBy(o) => prefix_width(&o.input),
        LogicalOperator::GroupBy(o) => prefix_width(&o.input),
        LogicalOperator::Join(o) => prefix_width(&o.left),
        LogicalOperator::Return(o) => prefix_width(&o.input),
        LogicalOperator::PhaseOut(o) => prefix_width(&o.input),
        LogicalOperator::PostJoin(o) => prefix_width(&o.input),
        LogicalOperator::PhaseIn(o) => o
            .annotation()
            .and_then(|a| a.schema.branches.first())
            .map_or(0, |b| b.shift),
        LogicalOperator::StageInput(o) => o.schema.branch(o.tag).map_or(0, |b| b.shift),
        LogicalOperator::Shuffle(_) | LogicalOperator::Exchange(_) => 0,
    }
}

/// Returns the key order the input already delivers, if it is sorted on
/// exactly `keys` by an order-preserving chain.
fn existing_order(input: &LogicalOperator, keys: &[usize]) -> Option<Vec<SortKey>> {
    match input {
        LogicalOperator::Filter(o) => existing_order(&o.input, keys),
        LogicalOperator::Let(o) => existing_order(&o.input, keys),
        LogicalOperator::OrderBy(o) => {
            let sort_keys: Vec<SortKey> = o
                .keys
                .iter()
                .map(|spec| {
                    spec.expression.as_slot().map(|slot| SortKey {
                        slot,
                        direction: spec.direction,
                        nulls: spec.nulls,
                    })
                })
                .collect::<Option<_>>()?;
            same_slots(&sort_keys, keys).then_some(sort_keys)
        }
        LogicalOperator::PhaseIn(o) => {
            let annotation = o.annotation()?;
            if annotation.site != ShuffleSite::OrderBy {
                return None;
            }
            let sort_keys = annotation.schema.branches.first()?.keys.clone();
            same_slots(&sort_keys, keys).then_some(sort_keys)
        }
        _ => None,
    }
}

fn same_slots(sort_keys: &[SortKey], keys: &[usize]) -> bool {
    sort_keys.len() == keys.len() && sort_keys.iter().zip(keys).all(|(k, &s)| k.slot == s)
}

/// Moves a pipeline behind a prefix of `prefix.len()` slots typed `prefix`.
///
/// Every slot reference, key, aggregate and schema in the pipeline is shifted
/// and every start operator reserves the prefix. The right input of an unsplit
/// join keeps its own numbering because that join appends its records.
pub(crate) fn shift_plan(op: &mut LogicalOperator, prefix: &[LogicalType]) {
    let offset = prefix.len();
    match op {
        LogicalOperator::Start(start) => {
            let mut prefilled = prefix.to_vec();
            prefilled.append(&mut start.prefilled);
            start.prefilled = prefilled;
        }
        LogicalOperator::Scan(_) => {}
        LogicalOperator::Let(o) => o.expression.shift_slots(offset),
        LogicalOperator::Filter(o) => o.predicate.shift_slots(offset),
        LogicalOperator::OrderBy(o) => {
            for key in &mut o.keys {
                key.expression.shift_slots(offset);
            }
        }
        LogicalOperator::GroupBy(o) => {
            for key in &mut o.keys {
                key.shift_slots(offset);
            }
            for aggregate in &mut o.aggregates {
                aggregate.input.shift(offset);
                aggregate.output += offset;
            }
        }
        LogicalOperator::Join(o) => {
            o.left_key.shift_slots(offset);
            shift_plan(&mut o.left, prefix);
            return;
        }
        LogicalOperator::Return(o) => {
            for column in &mut o.columns {
                column.expression.shift_slots(offset);
            }
        }
        LogicalOperator::PhaseOut(o) => shift_schema(&mut o.schema, prefix),
        LogicalOperator::Shuffle(o) => shift_schema(&mut o.annotation.schema, prefix),
        LogicalOperator::Exchange(o) => shift_schema(&mut o.annotation.schema, prefix),
        LogicalOperator::StageInput(o) => shift_schema(&mut o.schema, prefix),
        LogicalOperator::PostJoin(o) => {
            o.probe_key += offset;
            o.build_key += offset;
        }
        LogicalOperator::PhaseIn(_) => {}
    }
    for child in op.children_mut() {
        shift_plan(child, prefix);
    }
}

fn shift_schema(schema: &mut ShuffleSchema, prefix: &[LogicalType]) {
    for branch in &mut schema.branches {
        let mut types = prefix.to_vec();
        types.append(&mut branch.types);
        branch.types = types;
        for key in &mut branch.keys {
            key.slot += prefix.len();
        }
        branch.shift += prefix.len();
    }
}
