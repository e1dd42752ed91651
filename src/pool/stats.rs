//! Per-pool statistics

use crate::core::class::ExecutionClass;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Atomic counters shared by a pool's admission path and its workers
#[derive(Debug, Default)]
pub struct PoolStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
    unit_crashes: AtomicU64,
    unit_respawns: AtomicU64,
    running: AtomicUsize,
    total_processing_time_us: AtomicU64,
}

impl PoolStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.add_processing_time(elapsed);
    }

    pub(crate) fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_processing_time(elapsed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unit_crash(&self) {
        self.unit_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unit_respawn(&self) {
        self.unit_respawns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn job_stopped(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    fn add_processing_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_processing_time_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    /// Jobs accepted into the pool
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Jobs refused with `Overloaded`
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Jobs whose converter produced a document
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Jobs that ended in a converter or unit failure
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs abandoned by their waiter
    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Converter panics caught on pool threads
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Execution units lost mid-job
    pub fn unit_crashes(&self) -> u64 {
        self.unit_crashes.load(Ordering::Relaxed)
    }

    /// Replacement execution units started
    pub fn unit_respawns(&self) -> u64 {
        self.unit_respawns.load(Ordering::Relaxed)
    }

    /// Jobs currently inside a converter call
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Average converter time of finished jobs in microseconds
    pub fn average_processing_time_us(&self) -> f64 {
        let total = self.total_processing_time_us.load(Ordering::Relaxed);
        let count = self.completed() + self.failed();
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub(crate) fn snapshot(&self, occupancy: Occupancy) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            class: occupancy.class,
            max_concurrency: occupancy.max_concurrency,
            queue_depth: occupancy.queue_depth,
            occupied: occupancy.occupied,
            queued: occupancy.queued,
            running: self.running(),
            submitted: self.submitted(),
            rejected: self.rejected(),
            completed: self.completed(),
            failed: self.failed(),
            timed_out: self.timed_out(),
            panicked: self.panicked(),
            unit_crashes: self.unit_crashes(),
            unit_respawns: self.unit_respawns(),
            average_processing_time_us: self.average_processing_time_us(),
        }
    }
}

/// Capacity figures a pool reports alongside its counters
#[derive(Clone, Copy, Debug)]
pub(crate) struct Occupancy {
    pub(crate) class: ExecutionClass,
    pub(crate) max_concurrency: usize,
    pub(crate) queue_depth: usize,
    pub(crate) occupied: usize,
    pub(crate) queued: usize,
}

/// Point-in-time view of one pool
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Pool the figures belong to
    pub class: ExecutionClass,
    /// Configured concurrency ceiling
    pub max_concurrency: usize,
    /// Configured admission queue depth
    pub queue_depth: usize,
    /// Slots held by admitted, unfinished jobs
    pub occupied: usize,
    /// Jobs waiting for a worker
    pub queued: usize,
    /// Jobs inside a converter call
    pub running: usize,
    /// Jobs accepted
    pub submitted: u64,
    /// Jobs refused with `Overloaded`
    pub rejected: u64,
    /// Jobs completed successfully
    pub completed: u64,
    /// Jobs failed
    pub failed: u64,
    /// Jobs abandoned by their waiter
    pub timed_out: u64,
    /// Converter panics caught
    pub panicked: u64,
    /// Execution units lost mid-job
    pub unit_crashes: u64,
    /// Replacement execution units started
    pub unit_respawns: u64,
    /// Average converter time in microseconds
    pub average_processing_time_us: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PoolStats::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_rejected();
        stats.record_completed(Duration::from_micros(300));
        stats.record_failed(Duration::from_micros(100));
        stats.record_timed_out();

        assert_eq!(stats.submitted(), 2);
        assert_eq!(stats.rejected(), 1);
        assert_eq!(stats.completed(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.timed_out(), 1);
        assert!((stats.average_processing_time_us() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_gauge() {
        let stats = PoolStats::new();
        stats.job_started();
        stats.job_started();
        stats.job_stopped();
        assert_eq!(stats.running(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = PoolStats::new();
        stats.record_unit_crash();
        stats.record_unit_respawn();

        let snapshot = stats.snapshot(Occupancy {
            class: ExecutionClass::Heavy,
            max_concurrency: 2,
            queue_depth: 4,
            occupied: 1,
            queued: 0,
        });
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["class"], "heavy");
        assert_eq!(value["unit_crashes"], 1);
        assert_eq!(value["unit_respawns"], 1);
        assert_eq!(value["occupied"], 1);
    }
}
