//! Slot type resolution.
//!
//! Every operator's output types follow from its input types and its own
//! definition; the codec relies on these types and never inspects raw bytes
//! to guess them.

use sluice_common::types::LogicalType;
use sluice_common::utils::error::PlanError;
use sluice_core::execution::operators::{AggregateSpec, GroupPhase};
use sluice_core::execution::ScalarExpr;

use super::plan::LogicalOperator;

type PlanResult<T> = std::result::Result<T, PlanError>;

/// Resolves the slot types of the records `op` produces.
///
/// # Errors
///
/// Returns a plan error for unresolved slots, ill-typed expressions,
/// non-atomic keys, or operators that do not produce plain records.
pub fn output_types(op: &LogicalOperator) -> PlanResult<Vec<LogicalType>> {
    match op {
        LogicalOperator::Start(start) => Ok(start.prefilled.clone()),
        LogicalOperator::Scan(scan) => {
            let mut types = output_types(&scan.input)?;
            types.extend(scan.fields.iter().map(|f| f.ty.clone()));
            Ok(types)
        }
        LogicalOperator::Let(bind) => {
            let mut types = output_types(&bind.input)?;
            let ty = bind.expression.result_type(&types)?;
            types.push(ty);
            Ok(types)
        }
        LogicalOperator::Filter(filter) => {
            let types = output_types(&filter.input)?;
            let ty = filter.predicate.result_type(&types)?;
            if ty != LogicalType::Bool {
                return Err(PlanError::TypeMismatch {
                    expected: "BOOL predicate".into(),
                    found: ty.to_string(),
                });
            }
            Ok(types)
        }
        LogicalOperator::OrderBy(order) => {
            let types = output_types(&order.input)?;
            for key in &order.keys {
                let ty = key.expression.result_type(&types)?;
                if !ty.is_atomic() {
                    return Err(PlanError::NonAtomicKey {
                        slot: key.expression.as_slot().unwrap_or(types.len()),
                        ty,
                    });
                }
            }
            Ok(types)
        }
        LogicalOperator::GroupBy(group) => {
            let input = output_types(&group.input)?;
            let keys = key_slots(&group.keys, "group-by")?;
            group_output_types(&input, &keys, &group.aggregates, group.phase)
        }
        LogicalOperator::Join(join) => {
            let mut left = output_types(&join.left)?;
            let right = output_types(&join.right)?;
            let lt = join.left_key.result_type(&left)?;
            let rt = join.right_key.result_type(&right)?;
            check_join_key_types(&lt, &rt)?;
            left.extend(right);
            Ok(left)
        }
        LogicalOperator::Return(ret) => {
            let input = output_types(&ret.input)?;
            ret.columns
                .iter()
                .map(|c| c.expression.result_type(&input))
                .collect()
        }
        LogicalOperator::PhaseOut(out) => {
            let types = output_types(&out.input)?;
            let branch = out
                .schema
                .branch(out.tag)
                .map_err(|e| PlanError::Malformed(e.to_string()))?;
            if branch.types != types {
                return Err(PlanError::Malformed(format!(
                    "phase-out input has {} slots, its shuffle branch declares {}",
                    types.len(),
                    branch.width()
                )));
            }
            Ok(types)
        }
        LogicalOperator::PhaseIn(phase_in) => {
            let annotation = phase_in.annotation().ok_or_else(|| {
                PlanError::Malformed("phase-in must read a shuffle or an exchange".into())
            })?;
            if annotation.is_join() {
                return Err(PlanError::Malformed(
                    "tagged join records can only be consumed by a post join".into(),
                ));
            }
            annotation
                .schema
                .branches
                .first()
                .map(|b| b.types.clone())
                .ok_or_else(|| PlanError::Malformed("shuffle without branches".into()))
        }
        LogicalOperator::PostJoin(join) => {
            let LogicalOperator::PhaseIn(phase_in) = join.input.as_ref() else {
                return Err(PlanError::Malformed("post join must read a phase-in".into()));
            };
            let annotation = phase_in
                .annotation()
                .filter(|a| a.is_join())
                .ok_or_else(|| PlanError::Malformed("post join must read a join shuffle".into()))?;
            // Build records carry the probe record's slots as their prefix.
            annotation
                .schema
                .branches
                .get(1)
                .map(|b| b.types.clone())
                .ok_or_else(|| PlanError::Malformed("join shuffle without a build branch".into()))
        }
        LogicalOperator::StageInput(input) => input
            .schema
            .branch(input.tag)
            .map(|b| b.types.clone())
            .map_err(|e| PlanError::Malformed(e.to_string())),
        LogicalOperator::Shuffle(_) | LogicalOperator::Exchange(_) => Err(PlanError::Malformed(
            format!("{} does not produce records on its own", op.name()),
        )),
    }
}

/// Returns the slot of every key expression.
///
/// # Errors
///
/// Returns [`PlanError::NonVariableKey`] if a key is not a bare slot.
pub fn key_slots(keys: &[ScalarExpr], site: &'static str) -> PlanResult<Vec<usize>> {
    keys.iter()
        .map(|k| k.as_slot().ok_or(PlanError::NonVariableKey { site }))
        .collect()
}

/// Resolves the output types of a group-by.
///
/// Key slots keep their types, aggregate outputs get the aggregate's type for
/// `phase`, and every other input slot keeps its declared type while holding
/// a hole.
///
/// # Errors
///
/// Returns a plan error for unresolved or non-atomic keys, unsuitable
/// aggregate inputs, outputs overwriting keys, or unassigned output slots.
pub fn group_output_types(
    input: &[LogicalType],
    keys: &[usize],
    aggregates: &[AggregateSpec],
    phase: GroupPhase,
) -> PlanResult<Vec<LogicalType>> {
    for &slot in keys {
        let ty = input.get(slot).ok_or(PlanError::UnresolvedSlot {
            slot,
            width: input.len(),
        })?;
        if !ty.is_atomic() {
            return Err(PlanError::NonAtomicKey {
                slot,
                ty: ty.clone(),
            });
        }
    }
    let width = aggregates
        .iter()
        .map(|a| a.output + 1)
        .fold(input.len(), usize::max);
    let mut types: Vec<Option<LogicalType>> = input.iter().cloned().map(Some).collect();
    types.resize(width, None);
    for aggregate in aggregates {
        if keys.contains(&aggregate.output) {
            return Err(PlanError::Malformed(format!(
                "aggregate output slot {} overwrites a grouping key",
                aggregate.output
            )));
        }
        types[aggregate.output] = Some(aggregate.output_type(input, phase)?);
    }
    types
        .into_iter()
        .enumerate()
        .map(|(slot, ty)| {
            ty.ok_or_else(|| {
                PlanError::Malformed(format!("group-by output slot {slot} is never assigned"))
            })
        })
        .collect()
}

/// Checks that two join keys have the same atomic type.
///
/// # Errors
///
/// Returns a plan error for list-typed or differently typed keys.
pub fn check_join_key_types(left: &LogicalType, right: &LogicalType) -> PlanResult<()> {
    if !left.is_atomic() {
        return Err(PlanError::NonAtomicKey {
            slot: 0,
            ty: left.clone(),
        });
    }
    if left != right {
        return Err(PlanError::TypeMismatch {
            expected: left.to_string(),
            found: right.to_string(),
        });
    }
    Ok(())
}
