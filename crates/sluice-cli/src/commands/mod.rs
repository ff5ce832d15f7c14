//! CLI command implementations.

pub mod explain;
pub mod inspect;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use sluice_adapters::source::SourceSpec;
use sluice_engine::{Catalog, Config, GroupingStrategy, LogicalPlan, QueryEngine};

use crate::{Grouping, Overrides};

/// Contents of a job file.
#[derive(Deserialize)]
pub struct JobFile {
    /// Engine configuration; defaults apply to missing keys.
    #[serde(default)]
    pub config: Config,
    /// Collections the plan scans.
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    /// The logical plan.
    pub plan: LogicalPlan,
}

impl JobFile {
    /// Reads and parses a job file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing job file {}", path.display()))
    }

    /// Applies command-line overrides and builds the engine.
    pub fn into_engine(self, overrides: &Overrides) -> Result<(QueryEngine, LogicalPlan)> {
        let config = overrides.apply(self.config)?;
        let catalog = Catalog::from_specs(&self.sources).context("building sources")?;
        let engine = QueryEngine::with_catalog(config, Arc::new(catalog))?;
        Ok((engine, self.plan))
    }
}

impl Overrides {
    fn apply(&self, mut config: Config) -> Result<Config> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            config = serde_json::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
        }
        if let Some(dir) = &self.work_dir {
            config = config.with_work_dir(dir);
        }
        if let Some(name) = &self.job_name {
            config = config.with_job_name(name);
        }
        if let Some(partitions) = self.reduce_partitions {
            config = config.with_reduce_partitions(partitions);
        }
        if let Some(grouping) = self.grouping {
            config = config.with_grouping_strategy(match grouping {
                Grouping::Sort => GroupingStrategy::Sort,
                Grouping::Hash => GroupingStrategy::Hash,
            });
        }
        Ok(config)
    }
}
