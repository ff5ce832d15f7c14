//! Join operators.
//!
//! - [`StreamingHashJoin`]: consumes a tag-ordered shuffle (build runs before
//!   probe runs) and emits matches as the probe side streams past
//! - [`LocalHashJoin`]: in-memory fallback for joins that are not split into
//!   a shuffle

mod local;
mod streaming;
mod table;

pub use local::LocalHashJoin;
pub use streaming::{JoinState, StreamingHashJoin, StreamingJoinConfig};
pub use table::JoinHashTable;
