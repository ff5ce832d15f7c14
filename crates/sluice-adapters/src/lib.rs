//! # sluice-adapters
//!
//! Adapters layer for Sluice: the record sources a query scans and the
//! on-disk datasets that carry rows between stages.
//!
//! ## Modules
//!
//! - [`source`] - Record sources (in-memory rows, integer ranges, delimited files)
//! - [`storage`] - Intermediate dataset storage

pub mod source;
pub mod storage;
