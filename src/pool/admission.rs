//! Slot accounting and the admission queue
//!
//! Each pool owns `C + Q` slots: `C` for running jobs, `Q` for queued ones.
//! A slot is taken atomically at admission and handed back when the job's
//! [`PendingJob`] is dropped, i.e. once its converter call returned or its
//! execution unit was killed. A job that times out while still queued hands
//! its slot back at once. The queue itself is an unbounded channel; the
//! slot counter is what bounds it.

use crate::core::class::ExecutionClass;
use crate::core::error::ConversionError;
use crate::core::job::{ConversionJob, JobControl, JobState};
use crate::pool::stats::PoolStats;
use crate::pool::ticket::{JobTicket, PendingJob};
use crate::pool::InFlight;
use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free counter of occupied pool slots
#[derive(Debug)]
pub(crate) struct SlotCounter {
    occupied: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl SlotCounter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            occupied: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Take a slot, or report the occupancy observed when the pool was full
    pub(crate) fn try_acquire(self: &Arc<Self>) -> std::result::Result<SlotPermit, usize> {
        let mut current = self.occupied.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return Err(current);
            }
            match self.occupied.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(SlotPermit {
                        counter: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One occupied slot, released on drop
#[derive(Debug)]
pub(crate) struct SlotPermit {
    counter: Arc<SlotCounter>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.counter.occupied.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission path shared by a pool's submitters and its workers
pub(crate) struct AdmissionQueue {
    class: ExecutionClass,
    slots: Arc<SlotCounter>,
    sender: RwLock<Option<Sender<PendingJob>>>,
    receiver: Receiver<PendingJob>,
    stats: Arc<PoolStats>,
    registry: Arc<InFlight>,
}

impl AdmissionQueue {
    pub(crate) fn new(
        class: ExecutionClass,
        max_concurrency: usize,
        queue_depth: usize,
        stats: Arc<PoolStats>,
        registry: Arc<InFlight>,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            class,
            slots: Arc::new(SlotCounter::new(max_concurrency + queue_depth)),
            sender: RwLock::new(Some(sender)),
            receiver,
            stats,
            registry,
        }
    }

    /// Admit `job` or fail fast with `Overloaded`
    ///
    /// Closing the queue takes the write lock, so a job admitted here is
    /// always seen by a worker before the workers observe the closed channel.
    pub(crate) fn submit(
        &self,
        job: ConversionJob,
    ) -> std::result::Result<JobTicket, ConversionError> {
        let control = Arc::new(JobControl::new());

        let sender_guard = self.sender.read();
        let Some(sender) = sender_guard.as_ref() else {
            return Err(self.reject(&control, &job, self.slots.occupied()));
        };

        let permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(occupied) => return Err(self.reject(&control, &job, occupied)),
        };

        control.hold_slot(permit);
        // Admitted -> Queued cannot fail on a control nobody else has seen
        let _ = control.transition(JobState::Queued);
        let id = job.id();
        self.registry.insert(id, Arc::clone(&control));

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let pending = PendingJob::new(
            job,
            Arc::clone(&control),
            reply_tx,
            Arc::clone(&self.stats),
            Arc::clone(&self.registry),
        );

        // The queue keeps its own receiver, so the channel cannot be disconnected here
        if sender.send(pending).is_err() {
            return Err(ConversionError::converter_failure(
                "admission queue disconnected",
            ));
        }
        self.stats.record_submitted();

        #[cfg(feature = "tracing")]
        crate::tracing::metrics::record_admission(self.class, self.slots.occupied());

        Ok(JobTicket::new(id, self.class, control, reply_rx))
    }

    fn reject(
        &self,
        control: &JobControl,
        job: &ConversionJob,
        occupied: usize,
    ) -> ConversionError {
        let _ = control.transition(JobState::Rejected);
        self.stats.record_rejected();
        log::warn!(
            "{} pool rejected '{}' ({} bytes): {}/{} slots in use",
            self.class,
            job.filename(),
            job.len(),
            occupied,
            self.slots.capacity()
        );

        #[cfg(feature = "tracing")]
        crate::tracing::metrics::record_rejection(self.class);

        ConversionError::overloaded(self.class, occupied, self.slots.capacity())
    }

    /// Receiving end handed to workers
    pub(crate) fn receiver(&self) -> Receiver<PendingJob> {
        self.receiver.clone()
    }

    /// Stop admitting; workers drain what is queued, then see a disconnect
    pub(crate) fn close(&self) {
        self.sender.write().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    pub(crate) fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.occupied()
    }
}
