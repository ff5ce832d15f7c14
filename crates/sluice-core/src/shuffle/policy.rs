//! Partition and order policies over encoded keys.
//!
//! | Policy | Partition | Order within a partition |
//! |--------|-----------|--------------------------|
//! | [`TotalOrderPolicy`] | hash of the full key | key bytes |
//! | [`JoinPolicy`] | hash of the key without its tag byte | sub-partition, then tag descending |
//! | [`DiagnosticPolicy`] | delegated | constant or pseudo-random |

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Seed of the diagnostic policy's generator.
pub const DIAGNOSTIC_SEED: u64 = 42;

/// Bob Jenkins' one-at-a-time hash.
#[must_use]
pub fn one_at_a_time(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in bytes {
        h = h.wrapping_add(u32::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

fn bucket(hash: u32, buckets: usize) -> usize {
    (hash & i32::MAX as u32) as usize % buckets.max(1)
}

/// Routes encoded keys to partitions and orders them within a partition.
pub trait ShufflePolicy: Send + Sync + fmt::Debug {
    /// Returns the partition of `key`, in `0..partitions`.
    fn partition(&self, key: &[u8], partitions: usize) -> usize;

    /// Orders two keys of the same partition.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns the policy name.
    fn name(&self) -> &'static str;
}

/// Partitions and orders by the full key bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalOrderPolicy;

impl ShufflePolicy for TotalOrderPolicy {
    fn partition(&self, key: &[u8], partitions: usize) -> usize {
        bucket(one_at_a_time(key), partitions)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "total-order"
    }
}

/// Policy of a join shuffle.
///
/// Both branches of a key land in the same partition because the leading tag
/// byte is not hashed. Within a partition, keys are grouped into
/// `sub_partitions` hash ranges, and each range delivers its build records
/// (tag 1) before its probe records (tag 0).
#[derive(Debug, Clone, Copy)]
pub struct JoinPolicy {
    sub_partitions: usize,
}

impl JoinPolicy {
    /// Creates a join policy with `sub_partitions` hash ranges per partition.
    #[must_use]
    pub fn new(sub_partitions: usize) -> Self {
        Self {
            sub_partitions: sub_partitions.max(1),
        }
    }

    fn key_hash(key: &[u8]) -> u32 {
        one_at_a_time(key.get(1..).unwrap_or_default())
    }

    fn sub_partition(&self, key: &[u8]) -> usize {
        bucket(Self::key_hash(key), self.sub_partitions)
    }
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ShufflePolicy for JoinPolicy {
    fn partition(&self, key: &[u8], partitions: usize) -> usize {
        bucket(Self::key_hash(key), partitions)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let by_range = if self.sub_partitions > 1 {
            self.sub_partition(a).cmp(&self.sub_partition(b))
        } else {
            Ordering::Equal
        };
        by_range.then_with(|| b.first().cmp(&a.first()))
    }

    fn name(&self) -> &'static str {
        "join"
    }
}

/// Answer given by a [`DiagnosticPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticOrder {
    /// Every comparison answers "greater".
    Constant,
    /// Comparisons answer "less" or "greater" at random.
    Random,
}

/// Orders keys without regard to their content. Used to check that consumers
/// detect deliveries that break their ordering contract.
pub struct DiagnosticPolicy {
    inner: Arc<dyn ShufflePolicy>,
    order: DiagnosticOrder,
    rng: Mutex<StdRng>,
}

impl DiagnosticPolicy {
    /// Wraps `inner`, keeping its partitioning.
    #[must_use]
    pub fn new(inner: Arc<dyn ShufflePolicy>, order: DiagnosticOrder) -> Self {
        Self {
            inner,
            order,
            rng: Mutex::new(StdRng::seed_from_u64(DIAGNOSTIC_SEED)),
        }
    }
}

impl fmt::Debug for DiagnosticPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticPolicy")
            .field("inner", &self.inner)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl ShufflePolicy for DiagnosticPolicy {
    fn partition(&self, key: &[u8], partitions: usize) -> usize {
        self.inner.partition(key, partitions)
    }

    fn compare(&self, _a: &[u8], _b: &[u8]) -> Ordering {
        match self.order {
            DiagnosticOrder::Constant => Ordering::Greater,
            DiagnosticOrder::Random => {
                if self.rng.lock().random_bool(0.5) {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "diagnostic"
    }
}

/// Serializable choice of policy carried by a stage descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    /// [`TotalOrderPolicy`].
    TotalOrder,
    /// [`JoinPolicy`].
    Join {
        /// Hash ranges per partition.
        sub_partitions: usize,
    },
}

impl PolicyKind {
    /// Instantiates the policy.
    #[must_use]
    pub fn build(&self) -> Arc<dyn ShufflePolicy> {
        match *self {
            Self::TotalOrder => Arc::new(TotalOrderPolicy),
            Self::Join { sub_partitions } => Arc::new(JoinPolicy::new(sub_partitions)),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TotalOrder => write!(f, "total-order"),
            Self::Join { sub_partitions } => write!(f, "join({sub_partitions})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_at_a_time_reference_values() {
        assert_eq!(one_at_a_time(b""), 0);
        assert_eq!(one_at_a_time(b"a"), 0xca2e_9442);
        assert_eq!(
            one_at_a_time(b"The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
    }

    #[test]
    fn test_join_partition_ignores_tag() {
        let policy = JoinPolicy::new(5);
        for key in [&b"\x00\x01abc"[..], b"\x00\x01xyz", b"\x00"] {
            let mut build = key.to_vec();
            build[0] = 1;
            for partitions in [1, 3, 7, 64] {
                assert_eq!(policy.partition(key, partitions), policy.partition(&build, partitions));
            }
        }
    }

    #[test]
    fn test_join_order_puts_build_first() {
        let policy = JoinPolicy::new(1);
        let probe = b"\x00\x01k";
        let build = b"\x01\x01k";
        assert_eq!(policy.compare(build, probe), Ordering::Less);
        // Different keys of one range tie apart from the tag.
        assert_eq!(policy.compare(b"\x01\x01a", b"\x01\x01b"), Ordering::Equal);
    }

    #[test]
    fn test_join_order_groups_by_sub_partition() {
        let policy = JoinPolicy::new(4);
        let keys: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i % 2, 1, i]).collect();
        let mut sorted = keys.clone();
        sorted.sort_by(|a, b| policy.compare(a, b));
        for pair in sorted.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(policy.sub_partition(a) <= policy.sub_partition(b));
            if policy.sub_partition(a) == policy.sub_partition(b) {
                assert!(a[0] >= b[0]);
            }
        }
    }

    #[test]
    fn test_total_order() {
        let policy = TotalOrderPolicy;
        assert_eq!(policy.compare(b"ab", b"b"), Ordering::Less);
        assert!(policy.partition(b"ab", 4) < 4);
    }

    #[test]
    fn test_diagnostic_constant() {
        let policy = DiagnosticPolicy::new(Arc::new(TotalOrderPolicy), DiagnosticOrder::Constant);
        assert_eq!(policy.compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(policy.compare(b"b", b"a"), Ordering::Greater);
        assert_eq!(policy.partition(b"x", 8), TotalOrderPolicy.partition(b"x", 8));
    }
}
