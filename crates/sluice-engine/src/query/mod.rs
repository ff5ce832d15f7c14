//! Query compilation pipeline.
//!
//! - **Plan**: The logical operator tree a front-end hands in
//! - **Schema**: Slot type resolution over that tree
//! - **Rewriter**: Splits order-by, group-by and join sites around shuffles
//! - **Stages**: Cuts the rewritten tree into a stage graph
//! - **Planner**: Turns one stage pipeline into physical operators

pub mod plan;
pub mod planner;
pub mod rewriter;
pub mod schema;
pub mod stages;

pub use plan::{LogicalOperator, LogicalPlan};
pub use planner::{PhysicalPlanner, TaskInput};
pub use rewriter::PlanRewriter;
pub use schema::output_types;
pub use stages::{StageDescriptor, StageFragment, StageGraph, StageGraphBuilder, StageOutput};
