//! Process-backed pool for large documents
//!
//! Each slot is a supervisor thread that owns at most one worker process. The
//! supervisor hands jobs to its process one at a time and watches for two
//! things while it waits: the process dying (crash, abort, protocol garbage)
//! and the job's token being cancelled (timeout, caller gone, shutdown). In
//! both cases the process is killed and a fresh one is spawned before the
//! supervisor takes its next job. A unit is never reused after either event.

use crate::convert::{ConvertedDocument, ConverterError};
use crate::core::cancellation::CancellationToken;
use crate::core::class::ExecutionClass;
use crate::core::error::{ConversionError, EngineError, Result};
use crate::core::job::ConversionJob;
use crate::dispatch::config::WorkerCommand;
use crate::pool::admission::AdmissionQueue;
use crate::pool::stats::{Occupancy, PoolStats, PoolStatsSnapshot};
use crate::pool::ticket::{ConvertedRun, Outcome, PendingJob};
use crate::pool::worker::panic_message;
use crate::pool::{InFlight, JobTicket, WorkerPool};
use crate::process::unit::{ProcessUnit, UnitFailure};
use crate::process::WorkerReply;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SPAWN_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);
const UNIT_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Bounded exponential backoff with jitter between spawn attempts
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: BACKOFF_BASE }
    }

    fn reset(&mut self) {
        self.next = BACKOFF_BASE;
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        let half = u64::try_from(base.as_millis() / 2).unwrap_or(0);
        base + Duration::from_millis(fastrand::u64(0..=half))
    }
}

/// Per-slot supervisor state, owned by its thread
struct Supervisor {
    id: usize,
    command: WorkerCommand,
    stats: Arc<PoolStats>,
    unit: Option<ProcessUnit>,
    spawned_before: bool,
    backoff: Backoff,
}

impl Supervisor {
    fn run(mut self, queue: Receiver<PendingJob>, poll_interval: Duration) {
        log::debug!("heavy supervisor {} started", self.id);

        loop {
            match queue.recv_timeout(poll_interval) {
                Ok(pending) => self.handle(pending),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(unit) = self.unit.take() {
            unit.shutdown(UNIT_EXIT_GRACE);
        }
        log::debug!("heavy supervisor {} shutting down", self.id);
    }

    fn handle(&mut self, mut pending: PendingJob) {
        if !pending.begin() {
            log::debug!(
                "heavy supervisor {}: job {} abandoned while queued",
                self.id,
                pending.job().id()
            );
            return;
        }

        #[cfg(feature = "tracing")]
        let job_span = crate::tracing::job_span(pending.job());
        #[cfg(feature = "tracing")]
        let _job_guard = job_span.enter();

        if let Err(e) = self.ensure_unit(Some(pending.token())) {
            pending.finish(Err(e));
            return;
        }
        let Some(unit) = self.unit.as_mut() else {
            return;
        };

        let result = unit.run(pending.job(), pending.token());
        let job = pending.job();

        match result {
            Ok(reply) => {
                let outcome = reply_outcome(reply, job);
                if let Err(e) = &outcome {
                    log::error!("heavy unit {} failed on '{}': {}", self.id, job.filename(), e);
                }
                pending.finish(outcome);
            }
            Err(UnitFailure::Crashed(reason)) => {
                let status = self.discard_unit();
                self.stats.record_unit_crash();
                log::warn!(
                    "heavy unit {} crashed on '{}' ({}): {}",
                    self.id,
                    job.filename(),
                    status,
                    reason
                );

                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_unit_crash(self.id);

                pending.finish(Err(ConversionError::converter_failure(format!(
                    "execution unit crashed ({status}): {reason}"
                ))));
                // The slot stays held until the replacement is up
                self.replace_unit();
            }
            Err(UnitFailure::Abandoned) => {
                let status = self.discard_unit();
                log::warn!(
                    "heavy unit {} killed after '{}' was abandoned ({}): {}",
                    self.id,
                    job.filename(),
                    status,
                    pending
                        .token()
                        .reason()
                        .map(|r| r.to_string())
                        .unwrap_or_default()
                );
                self.replace_unit();
            }
        }
    }

    fn discard_unit(&mut self) -> String {
        match self.unit.take() {
            Some(unit) => unit.kill(),
            None => "no unit".to_string(),
        }
    }

    /// Spawn a replacement right away so the next job finds a fresh unit
    fn replace_unit(&mut self) {
        if let Err(e) = self.ensure_unit(None) {
            log::error!(
                "heavy supervisor {}: no replacement unit, will retry on the next job: {}",
                self.id,
                e
            );
        }
    }

    /// Make sure a live unit exists, spawning one with backoff if needed
    ///
    /// Gives up early when `token` is cancelled.
    fn ensure_unit(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> std::result::Result<(), ConversionError> {
        match self.unit.as_mut().map(|unit| unit.is_alive()) {
            Some(true) => return Ok(()),
            Some(false) => {
                // Died while idle; no job was running on it
                let status = self.discard_unit();
                self.stats.record_unit_crash();
                log::warn!("heavy unit {} died while idle ({})", self.id, status);

                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_unit_crash(self.id);
            }
            None => {}
        }

        let mut last_error = String::new();
        for attempt in 1..=SPAWN_ATTEMPTS {
            if token.is_some_and(|t| t.is_cancelled()) {
                break;
            }
            match ProcessUnit::spawn(&self.command, self.id) {
                Ok(unit) => {
                    if self.spawned_before {
                        self.stats.record_unit_respawn();
                        log::info!("heavy unit {} respawned as pid {}", self.id, unit.pid());

                        #[cfg(feature = "tracing")]
                        crate::tracing::metrics::record_unit_respawn(self.id);
                    }
                    self.spawned_before = true;
                    self.backoff.reset();
                    self.unit = Some(unit);
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    log::warn!(
                        "heavy supervisor {}: spawning '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        self.id,
                        self.command.program,
                        attempt,
                        SPAWN_ATTEMPTS,
                        delay,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < SPAWN_ATTEMPTS {
                        thread::sleep(delay);
                    }
                }
            }
        }

        Err(ConversionError::converter_failure(format!(
            "cannot start execution unit '{}': {}",
            self.command.program, last_error
        )))
    }
}

/// Map a worker reply; elapsed time is the converter time measured by the worker
fn reply_outcome(reply: WorkerReply, job: &ConversionJob) -> Outcome {
    match reply {
        WorkerReply::Converted {
            text,
            title,
            metadata,
            elapsed_ms,
        } => Ok(ConvertedRun {
            document: ConvertedDocument {
                text,
                title,
                metadata,
            },
            elapsed: Duration::from_millis(elapsed_ms),
        }),
        WorkerReply::Failed { kind, message } => Err(ConversionError::from_converter(
            ConverterError::new(kind, message),
            job.filename(),
        )),
    }
}

/// `C` supervisor threads, each owning one worker process
///
/// Units are spawned lazily on the first job a supervisor receives.
pub struct HeavyPool {
    admission: AdmissionQueue,
    supervisors: Mutex<Vec<(usize, thread::JoinHandle<()>)>>,
    stats: Arc<PoolStats>,
    max_concurrency: usize,
    queue_depth: usize,
}

impl std::fmt::Debug for HeavyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeavyPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("queue_depth", &self.queue_depth)
            .field("occupied", &self.admission.occupied())
            .finish()
    }
}

impl HeavyPool {
    pub(crate) fn start(
        max_concurrency: usize,
        queue_depth: usize,
        poll_interval: Duration,
        command: WorkerCommand,
        registry: Arc<InFlight>,
    ) -> Result<Self> {
        let stats = Arc::new(PoolStats::new());
        let admission = AdmissionQueue::new(
            ExecutionClass::Heavy,
            max_concurrency,
            queue_depth,
            Arc::clone(&stats),
            registry,
        );

        let mut supervisors = Vec::with_capacity(max_concurrency);
        for id in 0..max_concurrency {
            let supervisor = Supervisor {
                id,
                command: command.clone(),
                stats: Arc::clone(&stats),
                unit: None,
                spawned_before: false,
                backoff: Backoff::new(),
            };
            let queue = admission.receiver();
            let handle = thread::Builder::new()
                .name(format!("heavy-{}", id))
                .spawn(move || supervisor.run(queue, poll_interval));
            match handle {
                Ok(handle) => supervisors.push((id, handle)),
                Err(e) => {
                    admission.close();
                    return Err(EngineError::spawn_with_source(
                        ExecutionClass::Heavy,
                        id,
                        "cannot spawn supervisor thread",
                        e,
                    ));
                }
            }
        }

        log::info!(
            "heavy pool started: {} units, queue depth {}, worker '{}'",
            max_concurrency,
            queue_depth,
            command.program
        );

        Ok(Self {
            admission,
            supervisors: Mutex::new(supervisors),
            stats,
            max_concurrency,
            queue_depth,
        })
    }
}

impl WorkerPool for HeavyPool {
    fn class(&self) -> ExecutionClass {
        ExecutionClass::Heavy
    }

    fn submit(&self, job: ConversionJob) -> std::result::Result<JobTicket, ConversionError> {
        self.admission.submit(job)
    }

    fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot(Occupancy {
            class: ExecutionClass::Heavy,
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
        let supervisors = std::mem::take(&mut *self.supervisors.lock());
        let deadline = Instant::now() + timeout;
        let mut first_error = None;

        for (id, handle) in supervisors {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if !handle.is_finished() {
                log::warn!("heavy supervisor {} did not finish in time; thread may be leaked", id);
                continue;
            }
            if let Err(panic_info) = handle.join() {
                let e = EngineError::join(
                    ExecutionClass::Heavy,
                    id,
                    format!("supervisor panicked: {}", panic_message(panic_info.as_ref())),
                );
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

impl Drop for HeavyPool {
    fn drop(&mut self) {
        self.admission.close();
        // Supervisors own child processes; wait for them to reap their units
        if let Err(e) = self.join(UNIT_EXIT_GRACE * 5) {
            log::error!("{}", e);
        }
    }
}
