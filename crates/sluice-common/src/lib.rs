//! # sluice-common
//!
//! Foundation layer for Sluice: values, records, logical types, and the
//! error taxonomy shared by every other crate.
//!
//! This crate has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`types`] - Core type definitions (Value, LogicalType, Record)
//! - [`utils`] - Utility functions and helpers (hashing, errors)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod types;
pub mod utils;

// Re-export commonly used types at crate root
pub use types::{LogicalType, Record, Value};
pub use utils::error::{CodecError, Error, PlanError, Result};
