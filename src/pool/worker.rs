//! Light pool worker thread

use crate::convert::Converter;
use crate::core::class::ExecutionClass;
use crate::core::error::{ConversionError, EngineError, Result};
use crate::pool::stats::PoolStats;
use crate::pool::ticket::{ConvertedRun, Outcome, PendingJob};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::{debug, span, Level};

/// A thread running converter calls for the light pool
#[derive(Debug)]
pub struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create and start a worker pulling from `queue`
    ///
    /// # Shutdown Behavior
    ///
    /// Workers exit when the queue is closed and empty, so every admitted job
    /// is run (or found abandoned) before shutdown completes.
    pub(crate) fn spawn(
        id: usize,
        queue: Receiver<PendingJob>,
        converter: Arc<dyn Converter>,
        stats: Arc<PoolStats>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("light-{}", id))
            .spawn(move || Self::run(id, queue, converter, stats, poll_interval))
            .map_err(|e| {
                EngineError::spawn_with_source(
                    ExecutionClass::Light,
                    id,
                    "cannot spawn thread",
                    e,
                )
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    /// Worker ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Join the worker thread, giving up after `timeout`
    ///
    /// A converter that ignores its cancellation token can keep the thread
    /// busy forever; such a thread is left running and reported.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> Result<()> {
        match self.thread.take() {
            Some(thread) => join_with_timeout(self.id, thread, timeout),
            None => Ok(()),
        }
    }

    fn run(
        id: usize,
        queue: Receiver<PendingJob>,
        converter: Arc<dyn Converter>,
        stats: Arc<PoolStats>,
        poll_interval: Duration,
    ) {
        #[cfg(feature = "tracing")]
        let worker_span = span!(Level::DEBUG, "light_worker", id = id);
        #[cfg(feature = "tracing")]
        let _guard = worker_span.enter();

        log::debug!("light worker {} started", id);

        loop {
            match queue.recv_timeout(poll_interval) {
                Ok(mut pending) => {
                    if !pending.begin() {
                        log::debug!(
                            "light worker {}: job {} abandoned while queued",
                            id,
                            pending.job().id()
                        );
                        continue;
                    }
                    let outcome = Self::execute_job(id, &pending, converter.as_ref(), &stats);
                    if !pending.finish(outcome) {
                        log::debug!(
                            "light worker {}: result of job {} discarded after timeout",
                            id,
                            pending.job().id()
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("light worker {} shutting down", id);
                    break;
                }
            }
        }
    }

    /// Run the converter with panic protection
    #[allow(unused_variables)]
    fn execute_job(
        id: usize,
        pending: &PendingJob,
        converter: &dyn Converter,
        stats: &PoolStats,
    ) -> Outcome {
        let job = pending.job();

        #[cfg(feature = "tracing")]
        let job_span = crate::tracing::job_span(job);
        #[cfg(feature = "tracing")]
        let _job_guard = job_span.enter();

        let start = Instant::now();
        let input = job.input();
        let panic_result = catch_unwind(AssertUnwindSafe(|| {
            converter.convert(&input, pending.token())
        }));
        let elapsed = start.elapsed();

        match panic_result {
            Ok(Ok(document)) => {
                #[cfg(feature = "tracing")]
                debug!(duration_ms = elapsed.as_millis() as u64, "conversion completed");
                Ok(ConvertedRun { document, elapsed })
            }
            Ok(Err(e)) => {
                log::error!(
                    "light worker {}: {} failed on '{}': {}",
                    id,
                    converter.name(),
                    job.filename(),
                    e
                );
                Err(ConversionError::from_converter(e, job.filename()))
            }
            Err(panic_info) => {
                let panic_msg = panic_message(panic_info.as_ref());
                log::error!(
                    "light worker {}: {} panicked on '{}': {}",
                    id,
                    converter.name(),
                    job.filename(),
                    panic_msg
                );
                stats.record_panicked();

                #[cfg(feature = "tracing")]
                crate::tracing::metrics::record_panic(ExecutionClass::Light, elapsed);

                Err(ConversionError::converter_failure(format!(
                    "converter panicked: {panic_msg}"
                )))
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Use a timeout to prevent Drop from hanging indefinitely
            const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
            if let Err(e) = join_with_timeout(self.id, thread, JOIN_TIMEOUT) {
                log::error!("{}", e);
            }
        }
    }
}

fn join_with_timeout(id: usize, thread: thread::JoinHandle<()>, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if thread.is_finished() {
            return thread.join().map_err(|panic_info| {
                EngineError::join(
                    ExecutionClass::Light,
                    id,
                    format!("worker panicked: {}", panic_message(panic_info.as_ref())),
                )
            });
        }

        if start.elapsed() >= timeout {
            log::warn!(
                "light worker {} did not finish within {:?}; thread may be leaked",
                id,
                timeout
            );
            return Ok(());
        }

        thread::sleep(Duration::from_millis(10));
    }
}

pub(crate) fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ConversionInput, ConvertedDocument, ConverterError, PlainTextConverter};
    use crate::core::cancellation::CancellationToken;
    use crate::core::job::ConversionJob;
    use crate::pool::admission::AdmissionQueue;
    use crate::pool::InFlight;

    fn queue(stats: &Arc<PoolStats>) -> AdmissionQueue {
        AdmissionQueue::new(
            ExecutionClass::Light,
            1,
            4,
            Arc::clone(stats),
            Arc::new(InFlight::new()),
        )
    }

    fn job(bytes: &[u8], filename: &str) -> ConversionJob {
        ConversionJob::new(bytes.to_vec(), filename, ExecutionClass::Light)
    }

    #[test]
    fn test_worker_runs_jobs_and_exits_on_close() {
        let stats = Arc::new(PoolStats::new());
        let queue = queue(&stats);
        let worker = Worker::spawn(
            0,
            queue.receiver(),
            Arc::new(PlainTextConverter::new()),
            Arc::clone(&stats),
            Duration::from_millis(20),
        )
        .expect("Failed to create worker");
        assert_eq!(worker.id(), 0);

        let ticket = queue.submit(job(b"hello", "a.txt")).unwrap();
        let result = ticket.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(stats.completed(), 1);

        queue.close();
        worker
            .join_timeout(Duration::from_secs(5))
            .expect("Failed to join worker");
    }

    #[test]
    fn test_worker_panic_handling() {
        let stats = Arc::new(PoolStats::new());
        let queue = queue(&stats);
        let converter = |input: &ConversionInput<'_>, _: &CancellationToken| {
            if input.filename == "boom.txt" {
                panic!("Intentional panic for testing");
            }
            Ok::<_, ConverterError>(ConvertedDocument::new("fine"))
        };
        let worker = Worker::spawn(
            0,
            queue.receiver(),
            Arc::new(converter),
            Arc::clone(&stats),
            Duration::from_millis(20),
        )
        .expect("Failed to create worker");

        let err = queue
            .submit(job(b"", "boom.txt"))
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap_err();
        match err {
            ConversionError::ConverterFailure { message } => {
                assert!(message.contains("Intentional panic"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Worker continues processing after a panic
        let result = queue
            .submit(job(b"", "ok.txt"))
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap();
        assert_eq!(result.text, "fine");
        assert_eq!(stats.panicked(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.completed(), 1);

        queue.close();
        worker.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_converter_error_is_mapped() {
        let stats = Arc::new(PoolStats::new());
        let queue = queue(&stats);
        let worker = Worker::spawn(
            0,
            queue.receiver(),
            Arc::new(PlainTextConverter::new()),
            Arc::clone(&stats),
            Duration::from_millis(20),
        )
        .unwrap();

        let err = queue
            .submit(job(b"%PDF", "scan.pdf"))
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ConversionError::UnsupportedFormat { ref filename, .. } if filename == "scan.pdf"));

        queue.close();
        worker.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "Unknown panic");
    }
}
