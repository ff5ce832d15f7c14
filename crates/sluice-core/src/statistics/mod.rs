//! Statistics over hash-table occupancy.
//!
//! The streaming hash join reports these after every build so that skewed
//! keys or an undersized table show up in the logs.

use std::fmt;

/// Occupancy summary of a bucketed hash table.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BucketStatistics {
    /// Number of buckets.
    pub buckets: usize,
    /// Number of entries across all buckets.
    pub entries: usize,
    /// Smallest non-empty bucket, 0 if every bucket is empty.
    pub min_non_empty: usize,
    /// Largest bucket.
    pub max: usize,
    /// Mean entries per bucket.
    pub mean: f64,
    /// Standard deviation of entries per bucket.
    pub std_dev: f64,
    /// Number of empty buckets.
    pub empty: usize,
}

impl BucketStatistics {
    /// Computes statistics from per-bucket entry counts.
    #[must_use]
    pub fn from_sizes(sizes: impl IntoIterator<Item = usize>) -> Self {
        let sizes: Vec<usize> = sizes.into_iter().collect();
        if sizes.is_empty() {
            return Self::default();
        }
        let buckets = sizes.len();
        let entries: usize = sizes.iter().sum();
        let mean = entries as f64 / buckets as f64;
        let variance = sizes
            .iter()
            .map(|&s| {
                let d = s as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / buckets as f64;
        Self {
            buckets,
            entries,
            min_non_empty: sizes.iter().copied().filter(|&s| s > 0).min().unwrap_or(0),
            max: sizes.iter().copied().max().unwrap_or(0),
            mean,
            std_dev: variance.sqrt(),
            empty: sizes.iter().filter(|&&s| s == 0).count(),
        }
    }
}

impl fmt::Display for BucketStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min non-empty {}, max {}, avg {:.3}, std dev {:.3}, empty {}",
            self.min_non_empty, self.max, self.mean, self.std_dev, self.empty
        )
    }
}
