//! Plans compiled into stages and run on the local substrate.

use std::sync::Arc;

use sluice_adapters::source::MemorySource;
use sluice_common::types::{LogicalType, Record, Value};
use sluice_common::utils::error::Error;
use sluice_core::execution::ScalarExpr;
use sluice_core::execution::operators::{
    AggregateFunction, AggregateSpec, GroupMode, GroupPhase, NullOrder,
};
use sluice_core::execution::source::FieldDef;
use sluice_core::shuffle::DiagnosticOrder;
use sluice_engine::query::plan::{
    GroupByOp, JoinOp, OrderByOp, OrderSpec, ReturnColumn, ReturnOp, ScanOp, StartOp,
};
use sluice_engine::{Config, GroupingStrategy, LogicalOperator, LogicalPlan, QueryEngine};
use tempfile::TempDir;

fn row(values: Vec<Value>) -> Record {
    Record::new(values)
}

fn scan(collection: &str, fields: &[(&str, LogicalType)]) -> LogicalOperator {
    LogicalOperator::Scan(ScanOp {
        input: Box::new(LogicalOperator::Start(StartOp::default())),
        collection: collection.into(),
        fields: fields
            .iter()
            .map(|(name, ty)| FieldDef::new(*name, ty.clone()))
            .collect(),
        predicates: Vec::new(),
    })
}

fn engine(config: Config) -> (TempDir, QueryEngine) {
    let dir = tempfile::tempdir().unwrap();
    let engine = QueryEngine::new(config.with_work_dir(dir.path()).with_map_tasks(3)).unwrap();
    let catalog = engine.catalog();

    let pairs = vec![
        FieldDef::new("k", LogicalType::Int64),
        FieldDef::new("v", LogicalType::String),
    ];
    let pair_rows = vec![
        row(vec![Value::Int64(1), Value::from("a")]),
        row(vec![Value::Int64(2), Value::from("b")]),
        row(vec![Value::Int64(1), Value::from("c")]),
    ];
    catalog
        .register(Arc::new(MemorySource::new("pairs", pairs, pair_rows).unwrap()))
        .unwrap();

    let orders = vec![
        FieldDef::new("id", LogicalType::Int64),
        FieldDef::new("customer", LogicalType::Int64),
    ];
    let order_rows = (0..12)
        .map(|i| row(vec![Value::Int64(100 + i), Value::Int64(i % 4)]))
        .collect();
    catalog
        .register(Arc::new(MemorySource::new("orders", orders, order_rows).unwrap()))
        .unwrap();

    let customers = vec![
        FieldDef::new("cid", LogicalType::Int64),
        FieldDef::new("name", LogicalType::String),
    ];
    let customer_rows = vec![
        row(vec![Value::Int64(0), Value::from("ann")]),
        row(vec![Value::Int64(1), Value::from("bob")]),
        row(vec![Value::Int64(2), Value::from("cy")]),
        row(vec![Value::Int64(7), Value::from("dee")]),
    ];
    catalog
        .register(Arc::new(MemorySource::new("customers", customers, customer_rows).unwrap()))
        .unwrap();

    let scores = vec![
        FieldDef::new("player", LogicalType::String),
        FieldDef::new("score", LogicalType::Int64),
    ];
    let score_rows = vec![
        row(vec![Value::from("p1"), Value::Int64(30)]),
        row(vec![Value::from("p2"), Value::Null]),
        row(vec![Value::from("p3"), Value::Int64(90)]),
        row(vec![Value::from("p4"), Value::Int64(10)]),
        row(vec![Value::from("p5"), Value::Null]),
        row(vec![Value::from("p6"), Value::Int64(60)]),
        row(vec![Value::from("p7"), Value::Int64(60)]),
    ];
    catalog
        .register(Arc::new(MemorySource::new("scores", scores, score_rows).unwrap()))
        .unwrap();

    (dir, engine)
}

fn pairs() -> LogicalOperator {
    scan("pairs", &[("k", LogicalType::Int64), ("v", LogicalType::String)])
}

fn count_pairs() -> LogicalPlan {
    count_pairs_by(vec![ScalarExpr::slot(0)])
}

fn count_pairs_by(keys: Vec<ScalarExpr>) -> LogicalPlan {
    LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(LogicalOperator::GroupBy(GroupByOp {
            input: Box::new(pairs()),
            keys,
            aggregates: vec![AggregateSpec::new(AggregateFunction::Count, 1, 2)],
            phase: GroupPhase::Complete,
            mode: GroupMode::Hash,
            local: false,
        })),
        columns: vec![ReturnColumn::slot("k", 0), ReturnColumn::slot("n", 2)],
    }))
}

fn orders_join_customers() -> LogicalOperator {
    LogicalOperator::Join(JoinOp {
        left: Box::new(scan(
            "orders",
            &[("id", LogicalType::Int64), ("customer", LogicalType::Int64)],
        )),
        right: Box::new(scan(
            "customers",
            &[("cid", LogicalType::Int64), ("name", LogicalType::String)],
        )),
        left_key: ScalarExpr::slot(1),
        right_key: ScalarExpr::slot(0),
    })
}

/// Orders per customer name: join on the customer id, then count.
fn orders_per_customer() -> LogicalPlan {
    LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(LogicalOperator::GroupBy(GroupByOp {
            input: Box::new(orders_join_customers()),
            keys: vec![ScalarExpr::slot(3)],
            aggregates: vec![
                AggregateSpec::new(AggregateFunction::Count, 0, 4),
                AggregateSpec::new(AggregateFunction::Max, 0, 5),
            ],
            phase: GroupPhase::Complete,
            mode: GroupMode::Hash,
            local: false,
        })),
        columns: vec![
            ReturnColumn::slot("name", 3),
            ReturnColumn::slot("orders", 4),
            ReturnColumn::slot("latest", 5),
        ],
    }))
}

/// Customers joined with their order count.
fn customers_join_order_counts() -> LogicalPlan {
    let counts = LogicalOperator::GroupBy(GroupByOp {
        input: Box::new(scan(
            "orders",
            &[("id", LogicalType::Int64), ("customer", LogicalType::Int64)],
        )),
        keys: vec![ScalarExpr::slot(1)],
        aggregates: vec![AggregateSpec::new(AggregateFunction::Count, 0, 2)],
        phase: GroupPhase::Complete,
        mode: GroupMode::Hash,
        local: false,
    });
    LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(LogicalOperator::Join(JoinOp {
            left: Box::new(scan(
                "customers",
                &[("cid", LogicalType::Int64), ("name", LogicalType::String)],
            )),
            right: Box::new(counts),
            left_key: ScalarExpr::slot(0),
            right_key: ScalarExpr::slot(1),
        })),
        columns: vec![ReturnColumn::slot("name", 1), ReturnColumn::slot("orders", 4)],
    }))
}

fn as_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Int64(v)) => *v,
        other => panic!("expected an integer, found {other:?}"),
    }
}

fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.to_string(),
        other => panic!("expected a string, found {other:?}"),
    }
}

fn sorted_counts(rows: &[Record]) -> Vec<(String, i64, i64)> {
    let mut out: Vec<_> = rows
        .iter()
        .map(|r| (as_string(r.get(0)), as_i64(r.get(1)), as_i64(r.get(2))))
        .collect();
    out.sort();
    out
}

#[test]
fn test_distributed_count() {
    let (_dir, engine) = engine(Config::default().with_reduce_partitions(3));
    let result = engine.execute(count_pairs()).unwrap();
    assert_eq!(result.columns, vec!["k".to_string(), "n".to_string()]);
    assert_eq!(key_counts(&result.rows), vec![(1, 2), (2, 1)]);
}

fn key_counts(rows: &[Record]) -> Vec<(i64, i64)> {
    let mut counts: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| (as_i64(r.get(0)), as_i64(r.get(1))))
        .collect();
    counts.sort_unstable();
    counts
}

#[test]
fn test_count_with_keys_split_across_tasks() {
    for strategy in [GroupingStrategy::Sort, GroupingStrategy::Hash] {
        let (_dir, engine) = engine(Config::default().with_grouping_strategy(strategy));
        let result = engine.execute(count_pairs()).unwrap();
        assert_eq!(key_counts(&result.rows), vec![(1, 2), (2, 1)], "{strategy:?}");
    }
}

#[test]
fn test_group_by_with_repeated_key() {
    for strategy in [GroupingStrategy::Sort, GroupingStrategy::Hash] {
        let (_dir, engine) = engine(Config::default().with_grouping_strategy(strategy));
        let plan = count_pairs_by(vec![ScalarExpr::slot(0), ScalarExpr::slot(0)]);
        let result = engine.execute(plan).unwrap();
        assert_eq!(key_counts(&result.rows), vec![(1, 2), (2, 1)], "{strategy:?}");
    }
}

#[test]
fn test_order_by_with_repeated_key() {
    let (_dir, engine) = engine(Config::default());
    let plan = LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(LogicalOperator::OrderBy(OrderByOp {
            input: Box::new(pairs()),
            keys: vec![OrderSpec::ascending(0), OrderSpec::descending(0)],
            local: false,
        })),
        columns: vec![ReturnColumn::slot("k", 0), ReturnColumn::slot("v", 1)],
    }));
    let result = engine.execute(plan).unwrap();
    let rows: Vec<(i64, String)> = result
        .rows
        .iter()
        .map(|r| (as_i64(r.get(0)), as_string(r.get(1))))
        .collect();
    assert_eq!(rows.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![1, 1, 2]);
    assert_eq!(rows[2], (2, "b".to_string()));
    let mut ones: Vec<&str> = rows[..2].iter().map(|(_, v)| v.as_str()).collect();
    ones.sort_unstable();
    assert_eq!(ones, vec!["a", "c"]);
}

#[test]
fn test_join_then_group_by() {
    let (_dir, engine) = engine(Config::default().with_job_name("orders_q"));
    let graph = engine.compile(orders_per_customer()).unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.terminal, 2);
    assert_eq!(graph.stages[2].inputs, vec![0, 1]);

    let result = engine.execute(orders_per_customer()).unwrap();
    assert_eq!(
        sorted_counts(&result.rows),
        vec![
            ("ann".to_string(), 3, 108),
            ("bob".to_string(), 3, 109),
            ("cy".to_string(), 3, 110),
        ]
    );
}

#[test]
fn test_plain_join_matches_every_pair() {
    let (_dir, engine) = engine(Config::default().with_hash_table(4, 1));
    let plan = LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(orders_join_customers()),
        columns: vec![ReturnColumn::slot("id", 0), ReturnColumn::slot("name", 3)],
    }));
    let result = engine.execute(plan).unwrap();
    assert_eq!(result.len(), 9);
    assert!(
        result
            .rows
            .iter()
            .all(|r| (as_i64(r.get(0)) - 100) % 4 != 3)
    );
}

#[test]
fn test_descending_order_with_greatest_nulls() {
    let (_dir, engine) = engine(Config::default());
    let plan = LogicalPlan::new(LogicalOperator::Return(ReturnOp {
        input: Box::new(LogicalOperator::OrderBy(OrderByOp {
            input: Box::new(scan(
                "scores",
                &[("player", LogicalType::String), ("score", LogicalType::Int64)],
            )),
            keys: vec![OrderSpec::descending(1).with_nulls(NullOrder::Greatest)],
            local: false,
        })),
        columns: vec![ReturnColumn::slot("score", 1)],
    }));
    let result = engine.execute(plan).unwrap();
    let scores: Vec<Option<i64>> = result
        .rows
        .iter()
        .map(|r| match r.get(0) {
            Some(Value::Int64(v)) => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(
        scores,
        vec![None, None, Some(90), Some(60), Some(60), Some(30), Some(10)]
    );
}

#[test]
fn test_identity_copy_agrees_with_reencoding() {
    let (_fast_dir, fast) = engine(Config::default().with_raw_identity_mapper(true));
    let (_slow_dir, slow) = engine(Config::default().with_raw_identity_mapper(false));
    let names = |engine: &QueryEngine| {
        let mut rows: Vec<(String, i64)> = engine
            .execute(customers_join_order_counts())
            .unwrap()
            .rows
            .iter()
            .map(|r| (as_string(r.get(0)), as_i64(r.get(1))))
            .collect();
        rows.sort();
        rows
    };
    let expected = vec![
        ("ann".to_string(), 3),
        ("bob".to_string(), 3),
        ("cy".to_string(), 3),
    ];
    assert_eq!(names(&fast), expected);
    assert_eq!(names(&slow), expected);
}

#[test]
fn test_grouping_strategies_agree() {
    let (_sort_dir, sorted) = engine(Config::default().with_grouping_strategy(GroupingStrategy::Sort));
    let (_hash_dir, hashed) = engine(Config::default().with_grouping_strategy(GroupingStrategy::Hash));
    let a = sorted.execute(orders_per_customer()).unwrap();
    let b = hashed.execute(orders_per_customer()).unwrap();
    assert_eq!(sorted_counts(&a.rows), sorted_counts(&b.rows));
}

#[test]
fn test_content_blind_delivery_breaks_join_order() {
    let config = Config::default()
        .with_reduce_partitions(1)
        .with_hash_join_partitions(1)
        .with_diagnostic_order(Some(DiagnosticOrder::Random));
    let (_dir, engine) = engine(config);
    let plan = LogicalPlan::new(orders_join_customers());
    match engine.execute(plan) {
        Err(Error::Stage { seq, message }) => {
            assert_eq!(seq, 2);
            assert!(message.contains("join ordering violation"), "{message}");
        }
        other => panic!("expected a join ordering failure, got {other:?}"),
    }
}

#[test]
fn test_rewrite_is_idempotent() {
    let (_dir, engine) = engine(Config::default());
    for plan in [count_pairs(), orders_per_customer()] {
        let once = engine.rewrite(plan).unwrap();
        let twice = engine.rewrite(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}

#[test]
fn test_unknown_collection_fails_the_first_stage() {
    let (_dir, engine) = engine(Config::default());
    let plan = LogicalPlan::new(scan("missing", &[("x", LogicalType::Int64)]));
    assert!(matches!(engine.execute(plan), Err(Error::Stage { seq: 0, .. })));
}
