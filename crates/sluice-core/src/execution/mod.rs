//! Record-at-a-time execution primitives.
//!
//! - [`expression`] - Scalar expressions over record slots
//! - [`operators`] - Pull-based physical operators
//! - [`source`] - The record source interface scans read from

pub mod expression;
pub mod operators;
pub mod source;

pub use expression::{BinaryOp, ScalarExpr, UnaryOp};
pub use source::{
    CompareOp, FieldDef, RecordSource, RecordStream, ScanPredicate, ScanRequest, SourceCatalog,
    SourceSplit,
};
