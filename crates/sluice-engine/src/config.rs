//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sluice_common::utils::error::{Error, Result};
use sluice_core::shuffle::DiagnosticOrder;

/// How a distributed group-by is split around its shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Sort on the keys before the shuffle, merge sorted runs after it and
    /// group sequentially on both sides.
    #[default]
    Sort,
    /// Hash grouping on both sides; the exchange sorts each partition.
    Hash,
}

/// Configuration of a query engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix of intermediate dataset names.
    pub job_name: String,
    /// Root directory of intermediate datasets.
    pub work_dir: PathBuf,
    /// Group-by rewrite strategy.
    pub grouping_strategy: GroupingStrategy,
    /// Buckets in the streaming join table.
    pub hash_table_size: usize,
    /// Initial capacity of each join table bucket.
    pub hash_bucket_size: usize,
    /// Log bucket statistics after each hash table build.
    pub compute_hash_table_stats: bool,
    /// Sub-partitions of the join ordering.
    pub hash_join_partitions: usize,
    /// Reduce tasks of group-by and join shuffles.
    pub reduce_partitions: usize,
    /// Split hint for raw sources.
    pub map_tasks: usize,
    /// Copy identity branches byte for byte.
    pub raw_identity_mapper: bool,
    /// Clear datasets before rewriting them.
    pub delete_existing: bool,
    /// Deliver every shuffle in a content-blind order.
    pub diagnostic_order: Option<DiagnosticOrder>,
    /// Reducers check the order of delivered keys.
    pub validate_delivery_order: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_name: "SluiceJob".to_string(),
            work_dir: std::env::temp_dir().join("sluice"),
            grouping_strategy: GroupingStrategy::Sort,
            hash_table_size: 8192,
            hash_bucket_size: 3,
            compute_hash_table_stats: true,
            hash_join_partitions: 5,
            reduce_partitions: 4,
            map_tasks: 4,
            raw_identity_mapper: true,
            delete_existing: true,
            diagnostic_order: None,
            validate_delivery_order: true,
        }
    }
}

impl Config {
    /// Sets the job name.
    #[must_use]
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    /// Sets the dataset directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the group-by strategy.
    #[must_use]
    pub fn with_grouping_strategy(mut self, strategy: GroupingStrategy) -> Self {
        self.grouping_strategy = strategy;
        self
    }

    /// Sets the join table geometry.
    #[must_use]
    pub fn with_hash_table(mut self, size: usize, bucket_size: usize) -> Self {
        self.hash_table_size = size;
        self.hash_bucket_size = bucket_size;
        self
    }

    /// Enables or disables join table statistics.
    #[must_use]
    pub fn with_hash_table_stats(mut self, enabled: bool) -> Self {
        self.compute_hash_table_stats = enabled;
        self
    }

    /// Sets the join sub-partition count.
    #[must_use]
    pub fn with_hash_join_partitions(mut self, partitions: usize) -> Self {
        self.hash_join_partitions = partitions;
        self
    }

    /// Sets the reduce task count.
    #[must_use]
    pub fn with_reduce_partitions(mut self, partitions: usize) -> Self {
        self.reduce_partitions = partitions;
        self
    }

    /// Sets the split hint for raw sources.
    #[must_use]
    pub fn with_map_tasks(mut self, tasks: usize) -> Self {
        self.map_tasks = tasks;
        self
    }

    /// Enables or disables the identity byte-copy path.
    #[must_use]
    pub fn with_raw_identity_mapper(mut self, enabled: bool) -> Self {
        self.raw_identity_mapper = enabled;
        self
    }

    /// Enables or disables clearing datasets before they are written.
    #[must_use]
    pub fn with_delete_existing(mut self, enabled: bool) -> Self {
        self.delete_existing = enabled;
        self
    }

    /// Replaces every shuffle order with a diagnostic one.
    #[must_use]
    pub fn with_diagnostic_order(mut self, order: Option<DiagnosticOrder>) -> Self {
        self.diagnostic_order = order;
        self
    }

    /// Enables or disables the reduce-side order check.
    #[must_use]
    pub fn with_delivery_validation(mut self, enabled: bool) -> Self {
        self.validate_delivery_order = enabled;
        self
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("hash_table_size", self.hash_table_size),
            ("hash_bucket_size", self.hash_bucket_size),
            ("hash_join_partitions", self.hash_join_partitions),
            ("reduce_partitions", self.reduce_partitions),
            ("map_tasks", self.map_tasks),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        if self.job_name.is_empty()
            || !self
                .job_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Config(format!(
                "job name {:?} must be non-empty and use only letters, digits, '_' or '-'",
                self.job_name
            )));
        }
        Ok(())
    }
}
