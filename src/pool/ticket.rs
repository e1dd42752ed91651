//! Job handles on both sides of a pool
//!
//! A [`PendingJob`] travels through the admission queue to a worker and is the
//! only thing that can report an outcome. A [`JobTicket`] stays with the
//! caller, who waits on it. Both share the job's [`JobControl`], so whichever
//! side moves the state machine into a terminal state first decides what the
//! caller sees.

use crate::convert::ConvertedDocument;
use crate::core::cancellation::{CancellationReason, CancellationToken};
use crate::core::class::ExecutionClass;
use crate::core::error::ConversionError;
use crate::core::job::{ConversionJob, JobControl, JobId, JobState};
use crate::core::result::ConversionResult;
use crate::pool::stats::PoolStats;
use crate::pool::InFlight;
use crossbeam_channel::{select, Receiver, RecvError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A converter run that produced a document
#[derive(Debug)]
pub(crate) struct ConvertedRun {
    pub(crate) document: ConvertedDocument,
    pub(crate) elapsed: Duration,
}

/// What a worker reports for one job
pub(crate) type Outcome = std::result::Result<ConvertedRun, ConversionError>;

/// Worker side of an admitted job
///
/// Dropping it releases the pool slot, if a queued timeout did not already,
/// and removes the job from the in-flight registry, whether or not an outcome
/// was reported.
#[derive(Debug)]
pub(crate) struct PendingJob {
    job: ConversionJob,
    control: Arc<JobControl>,
    reply: Sender<Outcome>,
    stats: Arc<PoolStats>,
    registry: Arc<InFlight>,
    started: Option<Instant>,
}

impl PendingJob {
    pub(crate) fn new(
        job: ConversionJob,
        control: Arc<JobControl>,
        reply: Sender<Outcome>,
        stats: Arc<PoolStats>,
        registry: Arc<InFlight>,
    ) -> Self {
        Self {
            job,
            control,
            reply,
            stats,
            registry,
            started: None,
        }
    }

    pub(crate) fn job(&self) -> &ConversionJob {
        &self.job
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        self.control.token()
    }

    /// Move Queued -> Running; false if the waiter already gave up
    pub(crate) fn begin(&mut self) -> bool {
        if self.control.transition(JobState::Running).is_err() {
            return false;
        }
        self.started = Some(Instant::now());
        self.stats.job_started();
        true
    }

    /// Report the outcome if the job is still owned by its worker
    ///
    /// Returns false when the waiter abandoned the job first; the outcome is
    /// discarded in that case.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        let next = match outcome {
            Ok(_) => JobState::Succeeded,
            Err(_) => JobState::Failed,
        };
        if self.control.transition(next).is_err() {
            return false;
        }

        let elapsed = match &outcome {
            Ok(run) => run.elapsed,
            Err(_) => self.started.map(|s| s.elapsed()).unwrap_or_default(),
        };
        match &outcome {
            Ok(_) => self.stats.record_completed(elapsed),
            Err(_) => self.stats.record_failed(elapsed),
        }

        // The waiter may already be gone (dropped ticket); nothing to do then
        let _ = self.reply.send(outcome);
        true
    }
}

impl Drop for PendingJob {
    fn drop(&mut self) {
        // A queued job nobody will run is abandoned rather than left dangling
        if self.control.state() == JobState::Queued {
            self.control.abandon(CancellationReason::Shutdown);
        }
        // Running with no reported outcome: the worker lost the job
        if self.control.state() == JobState::Running {
            let _ = self.control.transition(JobState::Failed);
        }
        if self.control.state() == JobState::TimedOut {
            self.stats.record_timed_out();
        }
        if self.started.is_some() {
            self.stats.job_stopped();
        }
        self.registry.remove(&self.job.id());
        self.control.release_slot();
    }
}

/// Caller side of an admitted job
///
/// Returned by [`DispatchEngine::submit`](crate::DispatchEngine::submit).
/// Waiting consumes the ticket; dropping it without waiting leaves the job
/// running to completion with its result discarded.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    class: ExecutionClass,
    control: Arc<JobControl>,
    reply: Receiver<Outcome>,
}

impl JobTicket {
    pub(crate) fn new(
        id: JobId,
        class: ExecutionClass,
        control: Arc<JobControl>,
        reply: Receiver<Outcome>,
    ) -> Self {
        Self {
            id,
            class,
            control,
            reply,
        }
    }

    /// ID of the job
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Pool the job was routed to
    pub fn class(&self) -> ExecutionClass {
        self.class
    }

    /// Current lifecycle state
    pub fn state(&self) -> JobState {
        self.control.state()
    }

    /// Wait up to `timeout` for the job's outcome
    ///
    /// On expiry the job is abandoned: its state becomes `TimedOut` and its
    /// cancellation token fires. A result that arrives later is discarded.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`ConversionError`] of the job, or
    /// [`ConversionError::Timeout`] when the deadline passed first.
    pub fn wait(self, timeout: Duration) -> std::result::Result<ConversionResult, ConversionError> {
        self.wait_with_token(timeout, None)
    }

    /// Like [`wait`](Self::wait), also giving up when `caller` is cancelled
    ///
    /// Caller cancellation is reported as [`ConversionError::Timeout`].
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_with_token(
        self,
        timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded::<CancellationReason>(2);

        let _caller_guard = caller.map(|token| {
            let tx = wake_tx.clone();
            token.on_cancel(move || {
                let _ = tx.try_send(CancellationReason::CallerCancelled);
            })
        });
        // Fires when the engine abandons the job during shutdown
        let _job_guard = {
            let tx = wake_tx;
            self.control.token().on_cancel(move || {
                let _ = tx.try_send(CancellationReason::Shutdown);
            })
        };

        let timer = match Instant::now().checked_add(timeout) {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(self.reply) -> msg => self.collect(msg, timeout),
            recv(timer) -> _ => self.abandon(CancellationReason::Timeout(timeout), timeout),
            recv(wake_rx) -> reason => {
                let reason = reason.unwrap_or(CancellationReason::CallerCancelled);
                self.abandon(reason, timeout)
            }
        }
    }

    fn abandon(
        &self,
        reason: CancellationReason,
        timeout: Duration,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        log::debug!("abandoning {} job {}: {}", self.class, self.id, reason);
        if self.control.abandon(reason) || self.control.state() == JobState::TimedOut {
            return Err(self.timeout_error(timeout));
        }
        // The worker won the race; its outcome is on the way
        self.collect(self.reply.recv(), timeout)
    }

    fn collect(
        &self,
        msg: std::result::Result<Outcome, RecvError>,
        timeout: Duration,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        match msg {
            Ok(Ok(run)) => Ok(ConversionResult {
                job_id: self.id,
                text: run.document.text,
                title: run.document.title,
                metadata: run.document.metadata,
                elapsed: run.elapsed,
                class: self.class,
            }),
            Ok(Err(error)) => Err(error),
            Err(RecvError) if self.control.state() == JobState::TimedOut => {
                Err(self.timeout_error(timeout))
            }
            Err(RecvError) => Err(ConversionError::converter_failure(
                "job was dropped before it reported an outcome",
            )),
        }
    }

    fn timeout_error(&self, timeout: Duration) -> ConversionError {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        ConversionError::timeout(self.class, millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::admission::SlotCounter;
    use std::thread;

    struct Fixture {
        pending: PendingJob,
        ticket: JobTicket,
        stats: Arc<PoolStats>,
        registry: Arc<InFlight>,
        slots: Arc<SlotCounter>,
    }

    fn fixture() -> Fixture {
        let slots = Arc::new(SlotCounter::new(1));
        let stats = Arc::new(PoolStats::new());
        let registry = Arc::new(InFlight::new());
        let job = ConversionJob::new(b"abc".to_vec(), "a.txt", ExecutionClass::Light);
        let id = job.id();
        let control = Arc::new(JobControl::new());
        control.hold_slot(slots.try_acquire().unwrap());
        control.transition(JobState::Queued).unwrap();
        registry.insert(id, Arc::clone(&control));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let pending = PendingJob::new(
            job,
            Arc::clone(&control),
            tx,
            Arc::clone(&stats),
            Arc::clone(&registry),
        );
        let ticket = JobTicket::new(id, ExecutionClass::Light, control, rx);
        Fixture {
            pending,
            ticket,
            stats,
            registry,
            slots,
        }
    }

    fn run(text: &str) -> ConvertedRun {
        ConvertedRun {
            document: ConvertedDocument::new(text),
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_outcome_reaches_waiter() {
        let Fixture {
            mut pending,
            ticket,
            stats,
            registry,
            slots,
        } = fixture();

        assert!(pending.begin());
        assert!(pending.finish(Ok(run("done"))));
        drop(pending);

        assert_eq!(ticket.state(), JobState::Succeeded);
        let result = ticket.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(result.text, "done");
        assert_eq!(result.elapsed, Duration::from_millis(3));
        assert_eq!(stats.completed(), 1);
        assert!(registry.is_empty());
        assert_eq!(slots.occupied(), 0);
    }

    #[test]
    fn test_deadline_abandons_job() {
        let Fixture {
            mut pending,
            ticket,
            stats,
            slots,
            ..
        } = fixture();

        let err = ticket.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { timeout_ms: 20, .. }));
        assert!(pending.token().is_cancelled());
        // Never started, so the slot is free before a worker dequeues it
        assert_eq!(slots.occupied(), 0);

        // The worker can no longer start it
        assert!(!pending.begin());
        drop(pending);
        assert_eq!(stats.timed_out(), 1);
    }

    #[test]
    fn test_late_outcome_is_discarded() {
        let Fixture {
            mut pending,
            ticket,
            stats,
            slots,
            ..
        } = fixture();
        assert!(pending.begin());

        let err = ticket.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { .. }));
        // The converter call is still out, so the slot stays taken
        assert_eq!(slots.occupied(), 1);
        assert!(!pending.finish(Ok(run("too late"))));
        drop(pending);
        assert_eq!(slots.occupied(), 0);
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.timed_out(), 1);
        assert_eq!(stats.running(), 0);
    }

    #[test]
    fn test_caller_cancellation_reports_timeout() {
        let Fixture { pending, ticket, .. } = fixture();
        let caller = CancellationToken::new();
        let canceller = caller.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel_with_reason(CancellationReason::CallerCancelled);
        });

        let start = Instant::now();
        let err = ticket
            .wait_with_token(Duration::from_secs(10), Some(&caller))
            .unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            pending.token().reason(),
            Some(CancellationReason::CallerCancelled)
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_is_passed_through() {
        let Fixture {
            mut pending, ticket, ..
        } = fixture();
        assert!(pending.begin());
        pending.finish(Err(ConversionError::corrupt_input("a.txt", "bad")));

        let err = ticket.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConversionError::CorruptInput { .. }));
    }

    #[test]
    fn test_lost_job_is_a_failure() {
        let Fixture {
            mut pending, ticket, ..
        } = fixture();
        assert!(pending.begin());
        drop(pending);

        assert_eq!(ticket.state(), JobState::Failed);
        let err = ticket.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConversionError::ConverterFailure { .. }));
    }
}
