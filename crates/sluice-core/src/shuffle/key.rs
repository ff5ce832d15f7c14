//! Grouping keys and branch tags.
//!
//! A [`GroupingKey`] is created when a record is about to leave a worker
//! across a shuffle boundary: its key fields are lifted out of the record,
//! leaving holes, and remembered together with the slots they came from.
//! After the shuffle the key is spliced back into the decoded payload.
//!
//! Keys compare in one of two modes:
//!
//! | Mode | Values | Tag |
//! |------|--------|-----|
//! | Ordinary ([`Ord`], [`GroupingKey::compare`]) | lexicographic | tie-break |
//! | Join ([`GroupingKey::join_compare`]) | lexicographic | ignored |
//!
//! Source slots never take part in comparison or hashing.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use sluice_common::types::{Record, Value};
use sluice_common::utils::error::{Error, PlanError, Result};
use sluice_common::utils::hash::hash_one;

/// Identifies which join input produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchTag(pub u8);

impl BranchTag {
    /// Left input; streamed against the hash table.
    pub const PROBE: Self = Self(0);
    /// Right input; loaded into the hash table.
    pub const BUILD: Self = Self(1);

    /// Returns the branch index this tag selects.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for BranchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record reconstructed after a join shuffle, still carrying its branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRecord {
    /// Branch that produced the record.
    pub tag: BranchTag,
    /// The reconstructed record.
    pub record: Record,
}

/// Key fields lifted out of a record, with their provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupingKey {
    values: SmallVec<[Value; 4]>,
    source_slots: Option<Vec<usize>>,
    tag: Option<BranchTag>,
}

impl GroupingKey {
    /// Moves the values at `slots` out of `record`, leaving holes.
    ///
    /// A slot named more than once is taken once; later components repeat
    /// the value already lifted.
    ///
    /// # Errors
    ///
    /// Returns an error if a slot is out of range or holds a list.
    pub fn extract(record: &mut Record, slots: &[usize]) -> Result<Self> {
        let width = record.width();
        let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(slots.len());
        for (i, &slot) in slots.iter().enumerate() {
            if let Some(first) = slots[..i].iter().position(|&s| s == slot) {
                let repeated = values[first].clone();
                values.push(repeated);
                continue;
            }
            let value = record
                .take(slot)
                .ok_or(PlanError::UnresolvedSlot { slot, width })?;
            if let Value::List(_) = value {
                return Err(Error::Execution(format!(
                    "key slot {slot} holds a list; keys must be atomic"
                )));
            }
            values.push(value);
        }
        Ok(Self {
            values,
            source_slots: Some(slots.to_vec()),
            tag: None,
        })
    }

    /// Like [`extract`](Self::extract), marking the key with a join branch.
    ///
    /// # Errors
    ///
    /// Returns an error if a slot is out of range or holds a list.
    pub fn extract_tagged(record: &mut Record, slots: &[usize], tag: BranchTag) -> Result<Self> {
        let mut key = Self::extract(record, slots)?;
        key.tag = Some(tag);
        Ok(key)
    }

    /// Assembles a key from decoded parts.
    #[must_use]
    pub fn from_parts(
        values: impl IntoIterator<Item = Value>,
        source_slots: Option<Vec<usize>>,
        tag: Option<BranchTag>,
    ) -> Self {
        Self {
            values: values.into_iter().collect(),
            source_slots,
            tag,
        }
    }

    /// Returns the key values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the slots the values were taken from, if known.
    #[must_use]
    pub fn source_slots(&self) -> Option<&[usize]> {
        self.source_slots.as_deref()
    }

    /// Returns the branch tag of a join key.
    #[must_use]
    pub fn tag(&self) -> Option<BranchTag> {
        self.tag
    }

    /// Returns true for join keys.
    #[must_use]
    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }

    /// Number of key components, counting the tag.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.values.len() + usize::from(self.is_tagged())
    }

    /// Ordinary comparison: values lexicographically, then the tag.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.join_compare(other).then_with(|| self.tag.cmp(&other.tag))
    }

    /// Join comparison: values only.
    #[must_use]
    pub fn join_compare(&self, other: &Self) -> Ordering {
        self.values.as_slice().cmp(other.values.as_slice())
    }

    /// Hash consistent with [`compare`](Self::compare).
    #[must_use]
    pub fn hash_code(&self) -> u64 {
        hash_one(&(self.values.as_slice(), self.tag))
    }

    /// Hash consistent with [`join_compare`](Self::join_compare).
    #[must_use]
    pub fn join_hash(&self) -> u64 {
        hash_one(self.values.as_slice())
    }

    /// Splices the key values back into `record`.
    ///
    /// With known source slots each value returns to its slot. Without them
    /// the values fill the record's holes from left to right.
    ///
    /// # Errors
    ///
    /// Returns an error if a source slot is out of range or the record has
    /// fewer holes than the key has values.
    pub fn rebuild(&self, record: &mut Record) -> Result<()> {
        match &self.source_slots {
            Some(slots) => {
                for (&slot, value) in slots.iter().zip(&self.values) {
                    if !record.set(slot, value.clone()) {
                        return Err(PlanError::UnresolvedSlot {
                            slot,
                            width: record.width(),
                        }
                        .into());
                    }
                }
            }
            None => {
                let mut holes = (0..record.width())
                    .filter(|&s| record.get(s).is_some_and(Value::is_null))
                    .collect::<Vec<_>>()
                    .into_iter();
                for value in &self.values {
                    let slot = holes.next().ok_or_else(|| {
                        Error::Execution(format!(
                            "record {record} has no hole left for key value {value}"
                        ))
                    })?;
                    record.set(slot, value.clone());
                }
            }
        }
        Ok(())
    }

    /// Rebuilds a join record and attaches its branch tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is untagged or cannot be spliced.
    pub fn rebuild_tagged(&self, mut record: Record) -> Result<TaggedRecord> {
        let tag = self
            .tag
            .ok_or_else(|| Error::Execution("join record arrived without a branch tag".into()))?;
        self.rebuild(&mut record)?;
        Ok(TaggedRecord { tag, record })
    }
}

impl PartialEq for GroupingKey {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for GroupingKey {}

impl PartialOrd for GroupingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for GroupingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.values.as_slice().hash(state);
        self.tag.hash(state);
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        if let Some(tag) = self.tag {
            write!(f, "; tag {tag}")?;
        }
        write!(f, "]")
    }
}
