//! Stage execution.
//!
//! - [`task`] - Runs one map or reduce pipeline into its sink
//! - [`local`] - Runs a whole stage graph in this process

pub mod local;
pub mod task;

pub use local::LocalSubstrate;
pub use task::{TaskContext, TaskOutcome, TaskSink, run_task};
