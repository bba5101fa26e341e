//! Contract testing for HTTP APIs described as behaviors.
//!
//! A spec lists behaviors (request template, expected response, rules
//! over response fields, captures and dependencies). The runner orders
//! them by their `requires` graph, executes each against the target,
//! threads captured values forward and reports every behavior as
//! passed, failed or blocked.

pub mod checker;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod expression;
pub mod model;
pub mod path;
pub mod policy;
pub mod resolver;
pub mod rules;
pub mod runner;

pub use config::*;
pub use context::Context;
pub use error::*;
pub use executor::{ExecutorConfig, HttpExecutor};
pub use model::*;
pub use resolver::{resolve_order, DependencyGraph};
pub use runner::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
