//! Fixed-size bucketed hash table for the build side of a join.

use sluice_common::types::{Record, Value};
use sluice_common::utils::hash::hash_one;

use crate::statistics::BucketStatistics;

/// Default number of buckets.
pub const DEFAULT_TABLE_SIZE: usize = 8192;

/// Default initial bucket capacity.
pub const DEFAULT_BUCKET_CAPACITY: usize = 3;

/// A hash table with a fixed number of growable buckets.
///
/// Buckets are never rehashed; a bucket that fills up grows by
/// `bucket_capacity` entries at a time.
#[derive(Debug)]
pub struct JoinHashTable {
    buckets: Vec<Vec<(Value, Record)>>,
    bucket_capacity: usize,
    len: usize,
}

impl JoinHashTable {
    /// Creates a table of `size` buckets. A size of 0 is raised to 1.
    #[must_use]
    pub fn new(size: usize, bucket_capacity: usize) -> Self {
        let size = size.max(1);
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, Vec::new);
        Self {
            buckets,
            bucket_capacity: bucket_capacity.max(1),
            len: 0,
        }
    }

    fn bucket_of(&self, key: &Value) -> usize {
        ((hash_one(key) >> 12) % self.buckets.len() as u64) as usize
    }

    /// Inserts a build record under `key`.
    pub fn insert(&mut self, key: Value, record: Record) {
        let index = self.bucket_of(&key);
        let capacity = self.bucket_capacity;
        let bucket = &mut self.buckets[index];
        if bucket.len() == bucket.capacity() {
            bucket.reserve_exact(capacity);
        }
        bucket.push((key, record));
        self.len += 1;
    }

    /// Returns every build record stored under `key`, in insertion order.
    pub fn probe<'a>(&'a self, key: &'a Value) -> impl Iterator<Item = &'a Record> + 'a {
        self.buckets[self.bucket_of(key)]
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, r)| r)
    }

    /// Removes every entry, keeping the bucket allocations.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Computes bucket occupancy statistics.
    #[must_use]
    pub fn statistics(&self) -> BucketStatistics {
        BucketStatistics::from_sizes(self.buckets.iter().map(Vec::len))
    }
}
