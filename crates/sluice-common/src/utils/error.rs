//! Error types for Sluice.
//!
//! Errors fall into four families:
//!
//! | Family | Variant | Raised by | Retryable |
//! |--------|---------|-----------|-----------|
//! | Plan | [`Error::Plan`] | rewriter, stage builder | no |
//! | Schema/codec | [`Error::Codec`] | codec inside a worker | no |
//! | Join ordering | [`Error::JoinOrder`] | reduce side of a join stage | no |
//! | Substrate | [`Error::Stage`], [`Error::Io`] | local substrate | I/O only |

use thiserror::Error;

use crate::types::LogicalType;

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed plan, detected while rewriting or building stages.
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Encoded data disagrees with the bound schema.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A join stage received records out of the order its policy promises.
    #[error("join ordering violation: {0}")]
    JoinOrder(String),

    /// A stage failed; dependent stages are not started.
    #[error("stage {seq} failed: {message}")]
    Stage {
        /// Sequence number of the failed stage.
        seq: usize,
        /// Underlying failure.
        message: String,
    },

    /// Expression or operator evaluation failed.
    #[error("execution error: {0}")]
    Execution(String),

    /// A record source could not produce records.
    #[error("source error: {0}")]
    Source(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a plan fragment or dataset frame failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if retrying the failed operation could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Wraps this error as the failure of stage `seq`.
    #[must_use]
    pub fn in_stage(self, seq: usize) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                seq,
                message: other.to_string(),
            },
        }
    }
}

/// Static errors in a logical plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A key expression must be a bare slot reference.
    #[error("{site} requires variable references as keys")]
    NonVariableKey {
        /// Operator kind (order-by, group-by, join).
        site: &'static str,
    },

    /// A slot index points past the end of the input record.
    #[error("slot {slot} has not been resolved (input width {width})")]
    UnresolvedSlot {
        /// Offending slot.
        slot: usize,
        /// Width of the input record.
        width: usize,
    },

    /// Grouping keys must be atomic.
    #[error("key slot {slot} has non-atomic type {ty}")]
    NonAtomicKey {
        /// Offending slot.
        slot: usize,
        /// Its type.
        ty: LogicalType,
    },

    /// Operand types do not fit the operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type description.
        expected: String,
        /// Found type description.
        found: String,
    },

    /// Collation other than codepoint.
    #[error("unsupported collation: {0}")]
    UnsupportedCollation(String),

    /// Structurally invalid plan.
    #[error("malformed plan: {0}")]
    Malformed(String),
}

/// Errors decoding or encoding shuffle data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Codec used before being bound to a stage schema.
    #[error("no schema bound to codec")]
    MissingSchema,

    /// Record width disagrees with the schema.
    #[error("length of record is invalid: expected {expected}, found {found}")]
    WidthMismatch {
        /// Schema width.
        expected: usize,
        /// Record width.
        found: usize,
    },

    /// Value does not fit its slot type.
    #[error("slot {slot}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Slot index.
        slot: usize,
        /// Declared type.
        expected: LogicalType,
        /// Kind of the offending value.
        found: &'static str,
    },

    /// A tag byte names a branch the schema does not have.
    #[error("unknown branch tag {0}")]
    UnknownBranch(u8),

    /// Tag presence or value disagrees between key and payload or schema.
    #[error("branch tag mismatch: {0}")]
    TagMismatch(String),

    /// Input ended inside a field.
    #[error("truncated input at byte {0}")]
    Truncated(usize),

    /// Bytes left over after the last field.
    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),

    /// Structurally invalid bytes (bad marker, bad UTF-8, bad checksum).
    #[error("corrupt data: {0}")]
    Corrupt(String),
}
