//! Workflow Engine Core
//!
//! A workflow definition and execution engine: a directed graph of steps
//! connected by conditional/sequential/parallel connections, executed
//! against a SQLite-backed repository with optimistic concurrency, an
//! external inventory oracle for material/tool reservation, and a portable
//! JSON export/import envelope.

pub mod algorithms;
pub mod api;
pub mod codec;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod models;
pub mod navigator;
pub mod repository;
pub mod resources;
pub mod value;

/// Core engine version
pub const VERSION: &str = "0.1.0";

/// Initialize process-wide logging for the engine. Call once at process
/// startup before constructing an `Engine`.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    log::info!("workflow-engine-core v{} initialized", VERSION);
    Ok(())
}
