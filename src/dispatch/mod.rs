//! Configuration and the dispatch engine

pub mod config;
pub mod engine;

pub use config::{EngineConfig, WorkerCommand};
pub use engine::{DispatchEngine, EngineStatsSnapshot};
