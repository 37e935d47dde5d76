//! Vigil
//!
//! User & entity behavior analytics pipeline for MySQL: a hybrid harvester
//! over the DB's statement instrumentation, a Redis Streams transport with
//! consumer groups, a feature/enrichment engine, a layered detection engine
//! (signatures, sensitive-access, session aggregation, behavioral outlier
//! models) and an idempotent relational sink.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::{CommandLineArgs, Config};
pub use utils::error::{PipelineError, PipelineResult};
pub use utils::shutdown::Shutdown;

#[cfg(test)]
mod tests;
