//! The dispatch engine
//!
//! Classifies each request by size, admits it to the matching pool and waits
//! for its outcome within the caller's deadline. The engine blocks only on the
//! caller's own job and never holds a lock across a conversion call.

use crate::convert::Converter;
use crate::core::cancellation::{CancellationReason, CancellationToken};
use crate::core::class::{ExecutionClass, SizeClassifier};
use crate::core::error::{ConversionError, Result};
use crate::core::job::ConversionJob;
use crate::core::result::ConversionResult;
use crate::dispatch::config::EngineConfig;
use crate::pool::{HeavyPool, InFlight, JobTicket, LightPool, PoolStatsSnapshot, WorkerPool};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long shutdown waits for worker threads after the drain phase
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time statistics of the whole engine
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Time since the engine was started, in milliseconds
    pub uptime_ms: u64,
    /// Jobs admitted to either pool and not yet released
    pub in_flight: usize,
    /// Whether shutdown has begun
    pub shut_down: bool,
    /// Light pool figures
    pub light: PoolStatsSnapshot,
    /// Heavy pool figures
    pub heavy: PoolStatsSnapshot,
}

/// Owner of the light and heavy pools
///
/// # Example
///
/// ```rust
/// use docdispatch::{DispatchEngine, EngineConfig, ExecutionClass, PlainTextConverter};
/// use std::sync::Arc;
///
/// # fn main() -> docdispatch::Result<()> {
/// let config = EngineConfig::default().with_light_workers(2).with_heavy_workers(1);
/// let engine = DispatchEngine::new(config, Arc::new(PlainTextConverter::new()))?;
///
/// let result = engine.dispatch(b"hello".to_vec(), "greeting.txt", None).unwrap();
/// assert_eq!(result.text, "hello");
/// assert_eq!(result.class, ExecutionClass::Light);
///
/// engine.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct DispatchEngine {
    config: EngineConfig,
    classifier: SizeClassifier,
    light: LightPool,
    heavy: HeavyPool,
    registry: Arc<InFlight>,
    shut_down: AtomicBool,
    started_at: Instant,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .field("light", &self.light)
            .field("heavy", &self.heavy)
            .field("in_flight", &self.registry.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl DispatchEngine {
    /// Validate `config` and start both pools
    ///
    /// `converter` runs light jobs in-process. Heavy jobs run in worker
    /// processes launched with `config.worker_command`, which choose their own
    /// converter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`](crate::EngineError::InvalidConfig)
    /// for a bad configuration and
    /// [`EngineError::SpawnError`](crate::EngineError::SpawnError) if a pool
    /// thread cannot be started.
    pub fn new(config: EngineConfig, converter: Arc<dyn Converter>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(InFlight::new());
        let light = LightPool::start(
            config.light_workers,
            config.light_queue_depth,
            config.poll_interval,
            converter,
            Arc::clone(&registry),
        )?;
        let heavy = HeavyPool::start(
            config.heavy_workers,
            config.heavy_queue_depth,
            config.poll_interval,
            config.worker_command.clone(),
            Arc::clone(&registry),
        )?;

        log::info!(
            "dispatch engine started: threshold {} bytes, default timeout {:?}",
            config.size_threshold,
            config.default_timeout
        );

        Ok(Self {
            classifier: SizeClassifier::new(config.size_threshold),
            config,
            light,
            heavy,
            registry,
            shut_down: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution class for a payload of `byte_len` bytes
    pub fn classify(&self, byte_len: usize) -> ExecutionClass {
        self.classifier.classify(byte_len as u64)
    }

    /// The pool serving `class`
    pub fn pool(&self, class: ExecutionClass) -> &dyn WorkerPool {
        match class {
            ExecutionClass::Light => &self.light,
            ExecutionClass::Heavy => &self.heavy,
        }
    }

    /// Classify and admit a document without waiting for it
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::Overloaded`] when the target pool is full or
    /// the engine is shutting down.
    pub fn submit(
        &self,
        payload: Vec<u8>,
        filename: impl Into<String>,
    ) -> std::result::Result<JobTicket, ConversionError> {
        let class = self.classify(payload.len());
        let job = ConversionJob::new(payload, filename, class);

        match class {
            ExecutionClass::Heavy => log::info!(
                "routing '{}' ({} bytes) to the heavy pool as job {}",
                job.filename(),
                job.len(),
                job.id()
            ),
            ExecutionClass::Light => log::debug!(
                "routing '{}' ({} bytes) to the light pool as job {}",
                job.filename(),
                job.len(),
                job.id()
            ),
        }

        self.pool(class).submit(job)
    }

    /// Convert one document
    ///
    /// Waits at most `timeout`, or the configured default when `None`.
    ///
    /// # Errors
    ///
    /// Returns exactly one [`ConversionError`] tag per failed request.
    pub fn dispatch(
        &self,
        payload: Vec<u8>,
        filename: impl Into<String>,
        timeout: Option<Duration>,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        let ticket = self.submit(payload, filename)?;
        self.await_ticket(ticket, timeout, None)
    }

    /// Convert one document, abandoning it if `token` is cancelled
    ///
    /// Cancellation (typically a client disconnect) is handled exactly like
    /// an expired deadline and reported as [`ConversionError::Timeout`].
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub fn dispatch_with_token(
        &self,
        payload: Vec<u8>,
        filename: impl Into<String>,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        let ticket = self.submit(payload, filename)?;
        self.await_ticket(ticket, timeout, Some(token))
    }

    /// Async variant of [`dispatch`](Self::dispatch) for tokio callers
    ///
    /// The wait runs on tokio's blocking pool. Dropping the returned future
    /// abandons the job as if the caller had disconnected.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    #[cfg(feature = "async")]
    pub async fn dispatch_async(
        &self,
        payload: Vec<u8>,
        filename: impl Into<String>,
        timeout: Option<Duration>,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        let ticket = self.submit(payload, filename)?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let guard = CancelOnDrop::new();
        let token = guard.token();

        let waited = tokio::task::spawn_blocking(move || {
            ticket.wait_with_token(timeout, Some(&token))
        })
        .await;
        guard.disarm();

        match waited {
            Ok(outcome) => outcome,
            Err(e) => Err(ConversionError::converter_failure(format!(
                "waiter task failed: {e}"
            ))),
        }
    }

    fn await_ticket(
        &self,
        ticket: JobTicket,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> std::result::Result<ConversionResult, ConversionError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let (id, class) = (ticket.id(), ticket.class());
        let outcome = ticket.wait_with_token(timeout, token);

        match &outcome {
            Ok(result) => log::debug!(
                "job {} finished on the {} pool in {:?}",
                id,
                class,
                result.elapsed
            ),
            Err(e @ ConversionError::Timeout { .. }) => {
                log::warn!("job {}: {}", id, e);

                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_timeout(class);
            }
            Err(e @ ConversionError::ConverterFailure { .. }) => log::error!("job {}: {}", id, e),
            Err(e) => log::debug!("job {}: {}", id, e),
        }

        #[cfg(feature = "tracing")]
        if let Ok(result) = &outcome {
            crate::tracing::metrics::record_completion(class, result.elapsed);
        }

        outcome
    }

    /// Jobs admitted and not yet released by their worker
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of both pools
    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            uptime_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            in_flight: self.in_flight(),
            shut_down: self.is_shut_down(),
            light: self.light.stats(),
            heavy: self.heavy.stats(),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop admission, drain in-flight jobs and release workers
    ///
    /// Jobs still unfinished after `shutdown_grace` are abandoned: heavy units
    /// are killed and light converters see their token cancelled. Calling
    /// this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::JoinError`](crate::EngineError::JoinError) if a
    /// pool thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!(
            "dispatch engine shutting down with {} jobs in flight",
            self.registry.len()
        );

        self.light.close();
        self.heavy.close();

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.registry.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let leftover: Vec<_> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if !leftover.is_empty() {
            log::warn!(
                "cancelling {} jobs still in flight after the {:?} grace period",
                leftover.len(),
                self.config.shutdown_grace
            );
            for control in leftover {
                control.abandon(CancellationReason::Shutdown);
            }
        }

        let light = self.light.join(JOIN_TIMEOUT);
        let heavy = self.heavy.join(JOIN_TIMEOUT);
        log::info!("dispatch engine stopped");
        light.and(heavy)
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("error during engine shutdown: {}", e);
        }
    }
}

/// Cancels its token when dropped, unless disarmed
#[cfg(feature = "async")]
struct CancelOnDrop {
    token: CancellationToken,
    armed: bool,
}

#[cfg(feature = "async")]
impl CancelOnDrop {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            armed: true,
        }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

#[cfg(feature = "async")]
impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token
                .cancel_with_reason(CancellationReason::CallerCancelled);
        }
    }
}
