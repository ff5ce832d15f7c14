//! Per-branch type and key metadata of a shuffle boundary.

use serde::{Deserialize, Serialize};
use sluice_common::types::LogicalType;
use sluice_common::utils::error::{CodecError, PlanError};

use super::key::BranchTag;
use crate::execution::operators::SortKey;

/// Layout of the records one branch sends across a shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSchema {
    /// Type of every slot, including the pre-filled prefix.
    pub types: Vec<LogicalType>,
    /// Key fields, most significant first.
    pub keys: Vec<SortKey>,
    /// Number of leading slots owned by an enclosing stage. They are neither
    /// encoded nor decoded.
    pub shift: usize,
}

impl BranchSchema {
    /// Creates a branch schema.
    #[must_use]
    pub fn new(types: Vec<LogicalType>, keys: Vec<SortKey>, shift: usize) -> Self {
        Self { types, keys, shift }
    }

    /// Record width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.types.len()
    }

    /// Key slots in key order.
    #[must_use]
    pub fn key_slots(&self) -> Vec<usize> {
        self.keys.iter().map(|k| k.slot).collect()
    }

    /// Returns true if `slot` is a key slot.
    #[must_use]
    pub fn is_key_slot(&self, slot: usize) -> bool {
        self.keys.iter().any(|k| k.slot == slot)
    }

    /// Slots carried in the payload, ascending.
    pub fn payload_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (self.shift..self.width()).filter(|&s| !self.is_key_slot(s))
    }

    /// Checks that every key slot is in range, atomic and not pre-filled.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), PlanError> {
        for key in &self.keys {
            let ty = self.types.get(key.slot).ok_or(PlanError::UnresolvedSlot {
                slot: key.slot,
                width: self.width(),
            })?;
            if !ty.is_atomic() {
                return Err(PlanError::NonAtomicKey {
                    slot: key.slot,
                    ty: ty.clone(),
                });
            }
            if key.slot < self.shift {
                return Err(PlanError::Malformed(format!(
                    "key slot {} lies in the pre-filled prefix of width {}",
                    key.slot, self.shift
                )));
            }
        }
        Ok(())
    }
}

/// Metadata of one shuffle boundary: one branch, or two for a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleSchema {
    /// Branch schemas indexed by branch tag.
    pub branches: Vec<BranchSchema>,
    /// Whether keys and payloads carry a branch tag.
    pub is_join: bool,
}

impl ShuffleSchema {
    /// Creates a single-branch schema.
    #[must_use]
    pub fn single(branch: BranchSchema) -> Self {
        Self {
            branches: vec![branch],
            is_join: false,
        }
    }

    /// Creates a join schema from the probe and build branches.
    #[must_use]
    pub fn join(probe: BranchSchema, build: BranchSchema) -> Self {
        Self {
            branches: vec![probe, build],
            is_join: true,
        }
    }

    /// Returns the branch selected by `tag`, or the only branch if untagged.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag's presence disagrees with the schema or the
    /// tag selects no branch.
    pub fn branch(&self, tag: Option<BranchTag>) -> Result<&BranchSchema, CodecError> {
        match (self.is_join, tag) {
            (true, Some(tag)) => self
                .branches
                .get(tag.index())
                .ok_or(CodecError::UnknownBranch(tag.0)),
            (false, None) => self.branches.first().ok_or(CodecError::MissingSchema),
            (true, None) => Err(CodecError::TagMismatch(
                "join shuffle requires a branch tag".into(),
            )),
            (false, Some(tag)) => Err(CodecError::TagMismatch(format!(
                "branch tag {tag} on a single-branch shuffle"
            ))),
        }
    }

    /// Validates every branch.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), PlanError> {
        self.branches.iter().try_for_each(BranchSchema::validate)
    }
}
