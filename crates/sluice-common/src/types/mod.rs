//! Core type definitions for Sluice.
//!
//! This module contains the fundamental types every stage works with:
//! - Field values ([`Value`]) and their static types ([`LogicalType`])
//! - Fixed-width rows ([`Record`]) addressed by slot index

mod logical_type;
mod record;
mod value;

pub use logical_type::LogicalType;
pub use record::Record;
pub use value::Value;
