//! The dual worker pool
//!
//! Both pools share the same admission path ([`admission`]) and job handles
//! ([`ticket`]); they differ in what a slot is. A light slot is a thread in
//! this process, a heavy slot is a supervisor thread owning one worker
//! process.

pub(crate) mod admission;
pub mod heavy;
pub mod light;
pub mod stats;
pub mod ticket;
pub mod worker;

pub use heavy::HeavyPool;
pub use light::LightPool;
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use ticket::JobTicket;
pub use worker::Worker;

use crate::core::class::ExecutionClass;
use crate::core::error::{ConversionError, Result};
use crate::core::job::{ConversionJob, JobControl, JobId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Jobs admitted to either pool and not yet dropped by their worker
pub(crate) type InFlight = DashMap<JobId, Arc<JobControl>>;

/// Common surface of the light and heavy pools
pub trait WorkerPool: Send + Sync {
    /// Execution class served by this pool
    fn class(&self) -> ExecutionClass;

    /// Admit a job, failing fast with `Overloaded` when all `C + Q` slots are taken
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Overloaded`] when the pool is full or closed.
    fn submit(&self, job: ConversionJob) -> std::result::Result<JobTicket, ConversionError>;

    /// Point-in-time statistics
    fn stats(&self) -> PoolStatsSnapshot;

    /// Maximum number of concurrently running jobs (`C`)
    fn max_concurrency(&self) -> usize;

    /// Maximum number of queued jobs (`Q`)
    fn queue_depth(&self) -> usize;

    /// Whether admission has been stopped
    fn is_closed(&self) -> bool;

    /// Stop admission; queued jobs are still run
    fn close(&self);

    /// Wait up to `timeout` for the pool's workers to exit
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::JoinError`](crate::EngineError::JoinError) if a
    /// worker thread panicked.
    fn join(&self, timeout: Duration) -> Result<()>;
}
