//! Query engine: rewrite, compile and run logical plans.

use std::sync::Arc;

use serde::Serialize;
use sluice_adapters::source::value_to_json;
use sluice_common::types::{LogicalType, Record};
use sluice_common::utils::error::Result;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::query::plan::{LogicalOperator, LogicalPlan};
use crate::query::rewriter::PlanRewriter;
use crate::query::schema::output_types;
use crate::query::stages::{StageGraph, StageGraphBuilder};
use crate::runtime::LocalSubstrate;

/// Rows returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// Column types.
    pub types: Vec<LogicalType>,
    /// Result rows.
    pub rows: Vec<Record>,
}

#[derive(Serialize)]
struct JsonResult {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Renders the result as `{"columns": [...], "rows": [[...], ...]}`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|r| r.values().iter().map(value_to_json).collect())
            .collect();
        serde_json::to_value(JsonResult {
            columns: self.columns.clone(),
            rows,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Entry point for compiling and running plans.
pub struct QueryEngine {
    config: Config,
    catalog: Arc<Catalog>,
}

impl QueryEngine {
    /// Creates an engine with an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_catalog(config, Arc::new(Catalog::new()))
    }

    /// Creates an engine scanning `catalog`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn with_catalog(config: Config, catalog: Arc<Catalog>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, catalog })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Type-checks `plan` and splits its distributable sites.
    ///
    /// # Errors
    ///
    /// Returns a plan error if the plan is ill-typed or cannot be split.
    pub fn rewrite(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        output_types(&plan.root)?;
        PlanRewriter::new(self.config.grouping_strategy).rewrite(plan)
    }

    /// Rewrites `plan` and cuts it into stages.
    ///
    /// # Errors
    ///
    /// Returns a plan error if rewriting or stage construction fails.
    pub fn compile(&self, plan: LogicalPlan) -> Result<StageGraph> {
        let rewritten = self.rewrite(plan)?;
        StageGraphBuilder::new(&self.config).build(&rewritten)
    }

    /// Renders the rewritten plan and its stages.
    ///
    /// # Errors
    ///
    /// Returns a plan error if compilation fails.
    pub fn explain(&self, plan: LogicalPlan) -> Result<String> {
        let rewritten = self.rewrite(plan)?;
        let graph = StageGraphBuilder::new(&self.config).build(&rewritten)?;
        Ok(format!("{}\n{}", rewritten.explain(), graph.explain()?))
    }

    /// Compiles and runs `plan`.
    ///
    /// # Errors
    ///
    /// Returns the first compilation or stage failure.
    pub fn execute(&self, plan: LogicalPlan) -> Result<QueryResult> {
        let types = output_types(&plan.root)?;
        let columns = column_names(&plan.root, types.len());
        let graph = self.compile(plan)?;
        info!("compiled {} into {} stages", self.config.job_name, graph.len());
        let rows = LocalSubstrate::new(&self.config, self.catalog.as_ref()).run(&graph)?;
        Ok(QueryResult {
            columns,
            types,
            rows,
        })
    }
}

fn column_names(root: &LogicalOperator, width: usize) -> Vec<String> {
    match root {
        LogicalOperator::Return(ret) => ret.columns.iter().map(|c| c.name.clone()).collect(),
        _ => (0..width).map(|i| format!("_{i}")).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::plan::{ReturnColumn, ReturnOp, ScanOp, StartOp};
    use sluice_adapters::source::RangeSource;
    use sluice_core::execution::source::FieldDef;

    fn scan() -> LogicalOperator {
        LogicalOperator::Scan(ScanOp {
            input: Box::new(LogicalOperator::Start(StartOp::default())),
            collection: "numbers".into(),
            fields: vec![FieldDef::new("value", LogicalType::Int64)],
            predicates: Vec::new(),
        })
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(QueryEngine::new(Config::default().with_reduce_partitions(0)).is_err());
    }

    #[test]
    fn test_map_only_query() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QueryEngine::new(Config::default().with_work_dir(dir.path())).unwrap();
        engine
            .catalog()
            .register(Arc::new(RangeSource::new("numbers", 0, 5).unwrap()))
            .unwrap();

        let plan = LogicalPlan::new(LogicalOperator::Return(ReturnOp {
            input: Box::new(scan()),
            columns: vec![ReturnColumn::slot("n", 0)],
        }));
        let result = engine.execute(plan).unwrap();
        assert_eq!(result.columns, vec!["n".to_string()]);
        assert_eq!(result.len(), 5);
        let json = result.to_json();
        assert_eq!(json["columns"][0], "n");
        assert_eq!(json["rows"].as_array().map(Vec::len), Some(5));

        let unnamed = engine.execute(LogicalPlan::new(scan())).unwrap();
        assert_eq!(unnamed.columns, vec!["_0".to_string()]);
    }
}
