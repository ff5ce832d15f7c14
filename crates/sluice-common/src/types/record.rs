//! Fixed-width records.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Value;

/// An ordered, fixed-width row of field values addressed by slot index.
///
/// Slots that have not been populated yet (key slots of a decoded payload,
/// slots reserved for an enclosing stage) hold [`Value::Null`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    /// Creates a record from its values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Creates a record of `width` empty slots.
    #[must_use]
    pub fn with_width(width: usize) -> Self {
        Self {
            values: vec![Value::Null; width],
        }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// Returns the value at `slot`, if in range.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Value> {
        self.values.get(slot)
    }

    /// Overwrites the value at `slot`. Returns false if out of range.
    pub fn set(&mut self, slot: usize, value: Value) -> bool {
        match self.values.get_mut(slot) {
            Some(v) => {
                *v = value;
                true
            }
            None => false,
        }
    }

    /// Takes the value at `slot`, leaving a hole.
    pub fn take(&mut self, slot: usize) -> Option<Value> {
        self.values.get_mut(slot).map(std::mem::take)
    }

    /// Appends a slot.
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Resizes to `width` slots, padding with holes.
    pub fn resize(&mut self, width: usize) {
        self.values.resize(width, Value::Null);
    }

    /// Appends every slot of `other`.
    pub fn extend_from(&mut self, other: &Record) {
        self.values.extend(other.values.iter().cloned());
    }

    /// Overwrites the leading slots with the slots of `prefix`.
    ///
    /// Returns false, leaving `self` untouched, if `prefix` is wider.
    pub fn splice_prefix(&mut self, prefix: &Record) -> bool {
        if prefix.width() > self.width() {
            return false;
        }
        for (slot, value) in prefix.values.iter().enumerate() {
            self.values[slot] = value.clone();
        }
        true
    }

    /// Returns the slots as a slice.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the record, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}
