//! Hashing utilities.
//!
//! Hash tables that feed routing or bucket statistics must hash identically
//! in every worker of a run, so they use a fixed-seed [`ahash`] state instead
//! of a per-process random one.

use std::hash::{BuildHasher, Hash};

/// Hash map keyed with the fixed-seed hasher.
pub type FixedHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

/// Returns a hasher builder with fixed seeds.
#[must_use]
pub fn fixed_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        0x5151_7c3a_9e0d_2b41,
        0x0c8f_e2d4_71a6_93b5,
        0x2d35_8b1f_44c0_e7a9,
        0x9a7e_1c63_b5d2_0f48,
    )
}

/// Creates an empty [`FixedHashMap`].
#[must_use]
pub fn fixed_map<K, V>() -> FixedHashMap<K, V> {
    FixedHashMap::with_hasher(fixed_state())
}

/// Hashes a single value with the fixed-seed hasher.
#[must_use]
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    BuildHasher::hash_one(&fixed_state(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn test_hash_is_stable() {
        let a = hash_one(&Value::from("key"));
        let b = hash_one(&Value::from("key"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_one_matches_map_hasher() {
        let map: FixedHashMap<&str, ()> = fixed_map();
        assert_eq!(hash_one("key"), map.hasher().hash_one("key"));
    }

    #[test]
    fn test_fixed_map() {
        let mut map = fixed_map();
        map.insert(Value::Int64(1), 10);
        assert_eq!(map.get(&Value::Int64(1)), Some(&10));
    }
}
