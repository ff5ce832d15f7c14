//! Logical query plan representation.
//!
//! A plan is a tree of pipelines. Unary operators read from `input`; the
//! pipeline of every branch starts at a [`StartOp`] that emits one seed
//! record. Slots are assigned by the front-end and stay stable across
//! rewriting, except inside the build branch of a split join, whose slots are
//! shifted past the probe branch's output.
//!
//! The rewriter introduces the shuffle nodes ([`PhaseOutOp`], [`ShuffleOp`],
//! [`PhaseInOp`], [`PostJoinOp`]); the stage graph builder introduces
//! [`ExchangeOp`] and [`StageInputOp`] when it cuts the tree into stages.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use sluice_common::types::LogicalType;
use sluice_core::execution::operators::{
    AggregateSpec, GroupMode, GroupPhase, NullOrder, SortDirection,
};
use sluice_core::execution::source::{FieldDef, ScanPredicate};
use sluice_core::execution::ScalarExpr;
use sluice_core::shuffle::{BranchTag, ShuffleSchema};

/// A logical query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPlan {
    /// The root operator of the plan.
    pub root: LogicalOperator,
}

impl LogicalPlan {
    /// Creates a new logical plan with the given root operator.
    pub fn new(root: LogicalOperator) -> Self {
        Self { root }
    }

    /// Renders the operator tree, one operator per line.
    #[must_use]
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.root.explain_into(&mut out, 0);
        out
    }
}

/// A logical operator in the query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalOperator {
    /// Emit the seed record of a pipeline.
    Start(StartOp),
    /// Iterate a collection for each input record.
    Scan(ScanOp),
    /// Bind an expression to a new trailing slot.
    Let(LetOp),
    /// Drop records whose predicate is not true.
    Filter(FilterOp),
    /// Order records.
    OrderBy(OrderByOp),
    /// Group records and aggregate.
    GroupBy(GroupByOp),
    /// Equi-join two pipelines.
    Join(JoinOp),
    /// Produce output rows (terminal operator).
    Return(ReturnOp),
    /// Emit (key, payload) pairs into a shuffle.
    PhaseOut(PhaseOutOp),
    /// Redistribute the branches' pairs.
    Shuffle(ShuffleOp),
    /// Rebuild records from delivered pairs.
    PhaseIn(PhaseInOp),
    /// Streaming hash join over a tag-ordered join shuffle.
    PostJoin(PostJoinOp),
    /// The partition a reduce task reads, once the shuffle's branches have
    /// been cut away into the map side.
    Exchange(ExchangeOp),
    /// Pairs written by an earlier stage.
    StageInput(StageInputOp),
}

/// Seed of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartOp {
    /// Types of the leading slots reserved for an enclosing stage. The seed
    /// record holds a hole in each of them.
    #[serde(default)]
    pub prefilled: Vec<LogicalType>,
}

/// Scan a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Collection name.
    pub collection: String,
    /// Fields appended to each input record, in order.
    pub fields: Vec<FieldDef>,
    /// Predicates the source applies.
    #[serde(default)]
    pub predicates: Vec<ScanPredicate>,
}

/// Bind an expression to a new slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Bound expression.
    pub expression: ScalarExpr,
}

/// Filter records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Predicate.
    pub predicate: ScalarExpr,
}

/// One order-by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Key expression. Must be a slot reference for distributed execution.
    pub expression: ScalarExpr,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
    /// Placement of empty keys.
    #[serde(default)]
    pub nulls: NullOrder,
    /// Collation URI of string keys.
    #[serde(default)]
    pub collation: Option<String>,
}

impl OrderSpec {
    /// Creates an ascending key on `slot`.
    #[must_use]
    pub fn ascending(slot: usize) -> Self {
        Self {
            expression: ScalarExpr::Slot(slot),
            direction: SortDirection::Ascending,
            nulls: NullOrder::Least,
            collation: None,
        }
    }

    /// Creates a descending key on `slot`.
    #[must_use]
    pub fn descending(slot: usize) -> Self {
        Self {
            direction: SortDirection::Descending,
            ..Self::ascending(slot)
        }
    }

    /// Sets the placement of empty keys.
    #[must_use]
    pub fn with_nulls(mut self, nulls: NullOrder) -> Self {
        self.nulls = nulls;
        self
    }
}

/// Order records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Keys, most significant first.
    pub keys: Vec<OrderSpec>,
    /// Evaluate within the current task only.
    #[serde(default)]
    pub local: bool,
}

/// Group records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Grouping keys. Must be slot references.
    pub keys: Vec<ScalarExpr>,
    /// Aggregates.
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
    /// Aggregation phase.
    #[serde(default)]
    pub phase: GroupPhase,
    /// Grouping strategy.
    #[serde(default)]
    pub mode: GroupMode,
    /// Evaluate within the current task only.
    #[serde(default)]
    pub local: bool,
}

/// Inner equi-join. Output records are the left record followed by the
/// right record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOp {
    /// Left (probe) pipeline.
    pub left: Box<LogicalOperator>,
    /// Right (build) pipeline. Its slots are numbered from zero.
    pub right: Box<LogicalOperator>,
    /// Key over left records.
    pub left_key: ScalarExpr,
    /// Key over right records.
    pub right_key: ScalarExpr,
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnColumn {
    /// Column name.
    pub name: String,
    /// Column expression.
    pub expression: ScalarExpr,
}

impl ReturnColumn {
    /// Creates a column returning `slot`.
    pub fn slot(name: impl Into<String>, slot: usize) -> Self {
        Self {
            name: name.into(),
            expression: ScalarExpr::Slot(slot),
        }
    }
}

/// Produce output rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Output columns.
    pub columns: Vec<ReturnColumn>,
}

/// Emit pairs into a shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutOp {
    /// Input operator.
    pub input: Box<LogicalOperator>,
    /// Branch tag in a join shuffle.
    pub tag: Option<BranchTag>,
    /// Schema of the shuffle this branch feeds.
    pub schema: ShuffleSchema,
}

/// Why a shuffle exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleSite {
    /// Distributed order-by.
    OrderBy,
    /// Distributed group-by.
    GroupBy,
    /// Distributed join.
    Join,
}

impl fmt::Display for ShuffleSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderBy => write!(f, "order-by"),
            Self::GroupBy => write!(f, "group-by"),
            Self::Join => write!(f, "join"),
        }
    }
}

/// Typed metadata of a shuffle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleAnnotation {
    /// Operator the shuffle was introduced for.
    pub site: ShuffleSite,
    /// Key slots and types of every branch.
    pub schema: ShuffleSchema,
    /// Map outputs arrive sorted; reducers only merge them.
    pub skip_sort: bool,
}

impl ShuffleAnnotation {
    /// Returns true for a join shuffle.
    #[must_use]
    pub fn is_join(&self) -> bool {
        self.schema.is_join
    }
}

/// A shuffle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleOp {
    /// Branches, indexed by tag. Each is rooted at a [`PhaseOutOp`].
    pub branches: Vec<LogicalOperator>,
    /// Boundary metadata.
    pub annotation: ShuffleAnnotation,
}

/// Rebuild records after a shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInOp {
    /// A [`ShuffleOp`], or an [`ExchangeOp`] once staged.
    pub input: Box<LogicalOperator>,
}

impl PhaseInOp {
    /// Returns the annotation of the boundary this operator reads.
    #[must_use]
    pub fn annotation(&self) -> Option<&ShuffleAnnotation> {
        match self.input.as_ref() {
            LogicalOperator::Shuffle(shuffle) => Some(&shuffle.annotation),
            LogicalOperator::Exchange(exchange) => Some(&exchange.annotation),
            _ => None,
        }
    }
}

/// Streaming hash join consuming a join shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostJoinOp {
    /// A [`PhaseInOp`] over a join shuffle.
    pub input: Box<LogicalOperator>,
    /// Key slot of probe (tag 0) records.
    pub probe_key: usize,
    /// Key slot of build (tag 1) records.
    pub build_key: usize,
}

/// A delivered shuffle partition.
///
/// Without sources it is the partition of the stage's own shuffle. A join
/// exchange names the stages that partitioned its branches; partition `p` is
/// the merge of part `p` of every source dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOp {
    /// Boundary metadata.
    pub annotation: ShuffleAnnotation,
    /// Partitioned branch datasets, indexed by branch tag.
    #[serde(default)]
    pub sources: Vec<PartitionedSource>,
}

impl ExchangeOp {
    /// Returns true if partitions are merged from earlier stages.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        !self.sources.is_empty()
    }
}

/// A dataset written by a partitioning stage, one part per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedSource {
    /// Sequence number of the producing stage.
    pub seq: usize,
    /// Dataset name.
    pub dataset: String,
}

/// Pairs written by an earlier stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInputOp {
    /// Sequence number of the producing stage.
    pub seq: usize,
    /// Dataset name.
    pub dataset: String,
    /// Schema the pairs were encoded with.
    pub schema: ShuffleSchema,
    /// Branch the pairs were encoded for.
    pub tag: Option<BranchTag>,
}

impl LogicalOperator {
    /// Returns the operator name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "Start",
            Self::Scan(_) => "Scan",
            Self::Let(_) => "Let",
            Self::Filter(_) => "Filter",
            Self::OrderBy(_) => "OrderBy",
            Self::GroupBy(_) => "GroupBy",
            Self::Join(_) => "Join",
            Self::Return(_) => "Return",
            Self::PhaseOut(_) => "PhaseOut",
            Self::Shuffle(_) => "Shuffle",
            Self::PhaseIn(_) => "PhaseIn",
            Self::PostJoin(_) => "PostJoin",
            Self::Exchange(_) => "Exchange",
            Self::StageInput(_) => "StageInput",
        }
    }

    /// Returns the child operators.
    #[must_use]
    pub fn children(&self) -> Vec<&LogicalOperator> {
        match self {
            Self::Start(_) | Self::Exchange(_) | Self::StageInput(_) => Vec::new(),
            Self::Scan(op) => vec![op.input.as_ref()],
            Self::Let(op) => vec![op.input.as_ref()],
            Self::Filter(op) => vec![op.input.as_ref()],
            Self::OrderBy(op) => vec![op.input.as_ref()],
            Self::GroupBy(op) => vec![op.input.as_ref()],
            Self::Join(op) => vec![op.left.as_ref(), op.right.as_ref()],
            Self::Return(op) => vec![op.input.as_ref()],
            Self::PhaseOut(op) => vec![op.input.as_ref()],
            Self::Shuffle(op) => op.branches.iter().collect(),
            Self::PhaseIn(op) => vec![op.input.as_ref()],
            Self::PostJoin(op) => vec![op.input.as_ref()],
        }
    }

    /// Returns the child operators mutably.
    pub fn children_mut(&mut self) -> Vec<&mut LogicalOperator> {
        match self {
            Self::Start(_) | Self::Exchange(_) | Self::StageInput(_) => Vec::new(),
            Self::Scan(op) => vec![op.input.as_mut()],
            Self::Let(op) => vec![op.input.as_mut()],
            Self::Filter(op) => vec![op.input.as_mut()],
            Self::OrderBy(op) => vec![op.input.as_mut()],
            Self::GroupBy(op) => vec![op.input.as_mut()],
            Self::Join(op) => vec![op.left.as_mut(), op.right.as_mut()],
            Self::Return(op) => vec![op.input.as_mut()],
            Self::PhaseOut(op) => vec![op.input.as_mut()],
            Self::Shuffle(op) => op.branches.iter_mut().collect(),
            Self::PhaseIn(op) => vec![op.input.as_mut()],
            Self::PostJoin(op) => vec![op.input.as_mut()],
        }
    }

    /// Number of shuffle boundaries in this subtree.
    #[must_use]
    pub fn shuffle_count(&self) -> usize {
        let own = usize::from(matches!(self, Self::Shuffle(_)));
        own + self
            .children()
            .into_iter()
            .map(LogicalOperator::shuffle_count)
            .sum::<usize>()
    }

    /// Returns true if this subtree contains a shuffle boundary.
    #[must_use]
    pub fn contains_shuffle(&self) -> bool {
        self.shuffle_count() > 0
    }

    fn describe(&self) -> String {
        match self {
            Self::Start(op) if op.prefilled.is_empty() => "Start".to_string(),
            Self::Start(op) => format!("Start prefilled={}", op.prefilled.len()),
            Self::Scan(op) => {
                let fields: Vec<&str> = op.fields.iter().map(|f| f.name.as_str()).collect();
                format!("Scan {}({})", op.collection, fields.join(", "))
            }
            Self::Let(op) => format!("Let {:?}", op.expression),
            Self::Filter(op) => format!("Filter {:?}", op.predicate),
            Self::OrderBy(op) => {
                let keys: Vec<String> = op
                    .keys
                    .iter()
                    .map(|k| format!("{:?} {:?} nulls {:?}", k.expression, k.direction, k.nulls))
                    .collect();
                format!(
                    "OrderBy{} [{}]",
                    if op.local { " local" } else { "" },
                    keys.join(", ")
                )
            }
            Self::GroupBy(op) => {
                let aggs: Vec<String> = op
                    .aggregates
                    .iter()
                    .map(|a| format!("{}({:?})->{}", a.function.name(), a.input, a.output))
                    .collect();
                format!(
                    "GroupBy{} {:?} {:?} keys={:?} [{}]",
                    if op.local { " local" } else { "" },
                    op.phase,
                    op.mode,
                    op.keys,
                    aggs.join(", ")
                )
            }
            Self::Join(op) => format!("Join {:?} = {:?}", op.left_key, op.right_key),
            Self::Return(op) => {
                let names: Vec<&str> = op.columns.iter().map(|c| c.name.as_str()).collect();
                format!("Return [{}]", names.join(", "))
            }
            Self::PhaseOut(op) => match op.tag {
                Some(tag) => format!("PhaseOut tag={tag}"),
                None => "PhaseOut".to_string(),
            },
            Self::Shuffle(op) => format!(
                "Shuffle {}{}",
                op.annotation.site,
                if op.annotation.skip_sort { " skip-sort" } else { "" }
            ),
            Self::PhaseIn(_) => "PhaseIn".to_string(),
            Self::PostJoin(op) => format!("PostJoin probe={} build={}", op.probe_key, op.build_key),
            Self::Exchange(op) if op.is_merged() => {
                let seqs: Vec<String> = op.sources.iter().map(|s| format!("#{}", s.seq)).collect();
                format!("Exchange {} merging {}", op.annotation.site, seqs.join(", "))
            }
            Self::Exchange(op) => format!("Exchange {}", op.annotation.site),
            Self::StageInput(op) => format!("StageInput #{} {}", op.seq, op.dataset),
        }
    }

    pub(crate) fn explain_into(&self, out: &mut String, depth: usize) {
        let _ = writeln!(out, "{:indent$}{}", "", self.describe(), indent = depth * 2);
        for child in self.children() {
            child.explain_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> LogicalOperator {
        LogicalOperator::Scan(ScanOp {
            input: Box::new(LogicalOperator::Start(StartOp::default())),
            collection: "items".into(),
            fields: vec![FieldDef::new("id", LogicalType::Int64)],
            predicates: Vec::new(),
        })
    }

    #[test]
    fn test_children_and_explain() {
        let plan = LogicalPlan::new(LogicalOperator::Return(ReturnOp {
            input: Box::new(LogicalOperator::OrderBy(OrderByOp {
                input: Box::new(scan()),
                keys: vec![OrderSpec::descending(0)],
                local: false,
            })),
            columns: vec![ReturnColumn::slot("id", 0)],
        }));
        assert_eq!(plan.root.children().len(), 1);
        assert!(!plan.root.contains_shuffle());

        let text = plan.explain();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Return"));
        assert!(lines[2].starts_with("    Scan items(id)"));
    }

    #[test]
    fn test_plan_json_defaults() {
        let json = r#"{
            "root": {"Scan": {
                "input": {"Start": {}},
                "collection": "items",
                "fields": [{"name": "id", "ty": "Int64"}]
            }}
        }"#;
        let plan: LogicalPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.root, scan());
    }
}
