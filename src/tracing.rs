//! Tracing integration for observability.
//!
//! Available with the `tracing` feature. Every job runs inside a span carrying
//! its ID, filename, size and execution class, and the engine emits metric
//! events that a `tracing` subscriber can turn into counters and histograms.
//!
//! # Example
//!
//! ```rust,ignore
//! use docdispatch::prelude::*;
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env()
//!         .add_directive("docdispatch=debug".parse().unwrap()))
//!     .init();
//!
//! let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(PlainTextConverter::new()))?;
//! engine.dispatch(bytes, "report.txt", None)?;
//! ```

use crate::core::job::ConversionJob;

/// Span for one job's execution on a pool worker
pub fn job_span(job: &ConversionJob) -> tracing::Span {
    tracing::debug_span!(
        "conversion_job",
        job_id = %job.id(),
        filename = job.filename(),
        bytes = job.len() as u64,
        class = job.class().as_str(),
    )
}

/// Metrics recording functions for observability.
///
/// These functions emit tracing events that can be consumed by
/// metrics collection systems like Prometheus via tracing-opentelemetry.
pub mod metrics {
    use crate::core::class::ExecutionClass;
    use std::time::Duration;

    /// Records a job admitted to a pool.
    #[inline]
    pub fn record_admission(class: ExecutionClass, occupied: usize) {
        tracing::trace!(
            counter.jobs_admitted = 1,
            gauge.slots_occupied = occupied as i64,
            class = class.as_str(),
            "job admitted"
        );
    }

    /// Records a job refused with `Overloaded`.
    #[inline]
    pub fn record_rejection(class: ExecutionClass) {
        tracing::trace!(
            counter.jobs_rejected = 1,
            class = class.as_str(),
            "job rejected"
        );
    }

    /// Records a successful dispatch with its converter time.
    #[inline]
    pub fn record_completion(class: ExecutionClass, duration: Duration) {
        tracing::trace!(
            counter.jobs_completed = 1,
            histogram.job_duration_ms = duration.as_millis() as u64,
            class = class.as_str(),
            "job completed"
        );
    }

    /// Records a dispatch that ended in `Timeout`.
    #[inline]
    pub fn record_timeout(class: ExecutionClass) {
        tracing::trace!(
            counter.jobs_timed_out = 1,
            class = class.as_str(),
            "job timed out"
        );
    }

    /// Records a converter panic caught on a pool thread.
    #[inline]
    pub fn record_panic(class: ExecutionClass, duration: Duration) {
        tracing::trace!(
            counter.jobs_panicked = 1,
            histogram.job_duration_ms = duration.as_millis() as u64,
            class = class.as_str(),
            "converter panicked"
        );
    }

    /// Records a heavy unit lost mid-job.
    #[inline]
    pub fn record_unit_crash(slot: usize) {
        tracing::trace!(counter.unit_crashes = 1, slot = slot, "execution unit crashed");
    }

    /// Records a replacement heavy unit coming up.
    #[inline]
    pub fn record_unit_respawn(slot: usize) {
        tracing::trace!(counter.unit_respawns = 1, slot = slot, "execution unit respawned");
    }
}
