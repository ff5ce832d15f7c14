//! # sluice-core
//!
//! Core layer for Sluice: physical operators, the shuffle wire format and
//! the streaming hash join.
//!
//! This crate depends only on `sluice-common`.
//!
//! ## Modules
//!
//! - [`execution`] - Scalar expressions, record sources and physical operators
//! - [`shuffle`] - Grouping keys, codec, partition/order policies and exchange
//! - [`statistics`] - Hash-table bucket statistics

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod execution;
pub mod shuffle;
pub mod statistics;

// Re-export commonly used types
pub use execution::operators::{Operator, StreamingHashJoin};
pub use shuffle::{BranchTag, GroupingKey, ShuffleCodec, ShufflePolicy, ShuffleSchema};
pub use statistics::BucketStatistics;
