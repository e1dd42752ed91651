//! Thread-backed pool for small documents

use crate::convert::Converter;
use crate::core::class::ExecutionClass;
use crate::core::error::{ConversionError, Result};
use crate::core::job::ConversionJob;
use crate::pool::admission::AdmissionQueue;
use crate::pool::stats::{Occupancy, PoolStats, PoolStatsSnapshot};
use crate::pool::ticket::JobTicket;
use crate::pool::worker::Worker;
use crate::pool::{InFlight, WorkerPool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `C` threads sharing the dispatcher's memory, fed by one FIFO queue
///
/// A converter error or panic only affects its own job. Timeouts are
/// cooperative: an abandoned converter keeps its thread (and its slot) until
/// it returns.
pub struct LightPool {
    admission: AdmissionQueue,
    workers: Mutex<Vec<Worker>>,
    stats: Arc<PoolStats>,
    max_concurrency: usize,
    queue_depth: usize,
}

impl std::fmt::Debug for LightPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("queue_depth", &self.queue_depth)
            .field("occupied", &self.admission.occupied())
            .finish()
    }
}

impl LightPool {
    pub(crate) fn start(
        max_concurrency: usize,
        queue_depth: usize,
        poll_interval: Duration,
        converter: Arc<dyn Converter>,
        registry: Arc<InFlight>,
    ) -> Result<Self> {
        let stats = Arc::new(PoolStats::new());
        let admission = AdmissionQueue::new(
            ExecutionClass::Light,
            max_concurrency,
            queue_depth,
            Arc::clone(&stats),
            registry,
        );

        let mut workers = Vec::with_capacity(max_concurrency);
        for id in 0..max_concurrency {
            let worker = Worker::spawn(
                id,
                admission.receiver(),
                Arc::clone(&converter),
                Arc::clone(&stats),
                poll_interval,
            );
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Started workers exit once they see the closed queue
                    admission.close();
                    return Err(e);
                }
            }
        }

        log::info!(
            "light pool started: {} threads, queue depth {}, converter {}",
            max_concurrency,
            queue_depth,
            converter.name()
        );

        Ok(Self {
            admission,
            workers: Mutex::new(workers),
            stats,
            max_concurrency,
            queue_depth,
        })
    }
}

impl WorkerPool for LightPool {
    fn class(&self) -> ExecutionClass {
        ExecutionClass::Light
    }

    fn submit(&self, job: ConversionJob) -> std::result::Result<JobTicket, ConversionError> {
        self.admission.submit(job)
    }

    fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot(Occupancy {
            class: ExecutionClass::Light,
            max_concurrency: self.max_concurrency,
            queue_depth: self.queue_depth,
            occupied: self.admission.occupied(),
            queued: self.admission.queued(),
        })
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    fn is_closed(&self) -> bool {
        self.admission.is_closed()
    }

    fn close(&self) {
        self.admission.close();
    }

    fn join(&self, timeout: Duration) -> Result<()> {
        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + timeout;
        let mut first_error = None;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = worker.join_timeout(remaining) {
                log::error!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for LightPool {
    fn drop(&mut self) {
        self.admission.close();
    }
}
