//! # sluice-engine
//!
//! Compiles logical query plans into stage graphs and runs them.
//!
//! ## Modules
//!
//! - [`config`] - Configuration options
//! - [`catalog`] - Registry of scannable collections
//! - [`query`] - Plan representation, rewriting, staging and physical planning
//! - [`runtime`] - Task and stage execution
//! - [`engine`] - The [`QueryEngine`] entry point

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod config;
pub mod engine;
pub mod query;
pub mod runtime;

pub use catalog::Catalog;
pub use config::{Config, GroupingStrategy};
pub use engine::{QueryEngine, QueryResult};
pub use query::{LogicalOperator, LogicalPlan, PlanRewriter, StageGraph};
