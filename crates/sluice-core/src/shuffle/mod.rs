//! Everything that moves records across a shuffle boundary.
//!
//! ```text
//! record --GroupingKey::extract--> (key, record with holes)
//!        --ShuffleCodec--> (key bytes, payload bytes)
//!        --ShufflePolicy--> partition, order
//!        --Exchange--> delivered pairs
//!        --ShuffleCodec + GroupingKey::rebuild--> record
//! ```

pub mod codec;
pub mod exchange;
pub mod key;
pub mod phase;
pub mod policy;
pub mod schema;

pub use codec::ShuffleCodec;
pub use exchange::{
    DeliveryMode, Exchange, MergePairReader, PairReader, PairWriter, PartitionedOutput, ShufflePair,
    VecPairReader,
};
pub use key::{BranchTag, GroupingKey, TaggedRecord};
pub use phase::{OrderCheck, PhaseInOperator, PhaseInReader, PhaseOutWriter, TaggedPhaseIn};
pub use policy::{
    DiagnosticOrder, DiagnosticPolicy, JoinPolicy, PolicyKind, ShufflePolicy, TotalOrderPolicy,
};
pub use schema::{BranchSchema, ShuffleSchema};
