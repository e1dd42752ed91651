//! Conversion jobs and their lifecycle

use crate::core::cancellation::{CancellationReason, CancellationToken};
use crate::core::class::ExecutionClass;
use crate::convert::ConversionInput;
use crate::pool::admission::SlotPermit;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use uuid::Uuid;

/// Unique identifier of a conversion job
pub type JobId = Uuid;

/// An admitted conversion request
///
/// Immutable once created. The execution class is decided before the job is
/// built and never changes afterwards.
pub struct ConversionJob {
    id: JobId,
    payload: Vec<u8>,
    filename: String,
    submitted_at: DateTime<Utc>,
    class: ExecutionClass,
}

impl fmt::Debug for ConversionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionJob")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("payload_len", &self.payload.len())
            .field("submitted_at", &self.submitted_at)
            .field("class", &self.class)
            .finish()
    }
}

impl ConversionJob {
    /// Create a job with a fresh ID, stamped with the current time
    pub fn new(payload: Vec<u8>, filename: impl Into<String>, class: ExecutionClass) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            filename: filename.into(),
            submitted_at: Utc::now(),
            class,
        }
    }

    /// Job ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Raw payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Filename hint supplied by the caller
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Wall-clock admission time
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Execution class assigned at admission
    pub fn class(&self) -> ExecutionClass {
        self.class
    }

    /// Borrowed view handed to converters
    pub fn input(&self) -> ConversionInput<'_> {
        ConversionInput {
            bytes: &self.payload,
            filename: &self.filename,
        }
    }
}

/// Lifecycle state of a job
///
/// ```text
/// Admitted -> Queued -> Running -> Succeeded | Failed | TimedOut
///    |          |
///    v          v
/// Rejected   TimedOut
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobState {
    /// Created, not yet accepted by a pool
    Admitted = 0,
    /// Accepted and waiting for a free worker
    Queued = 1,
    /// Picked up by a worker
    Running = 2,
    /// Converter produced a document
    Succeeded = 3,
    /// Converter or execution unit failed
    Failed = 4,
    /// Abandoned by its waiter before finishing
    TimedOut = 5,
    /// Refused at submission because the pool was full
    Rejected = 6,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Admitted,
            1 => JobState::Queued,
            2 => JobState::Running,
            3 => JobState::Succeeded,
            4 => JobState::Failed,
            5 => JobState::TimedOut,
            _ => JobState::Rejected,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Rejected
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Admitted, Queued)
                | (Admitted, Rejected)
                | (Queued, Running)
                | (Queued, TimedOut)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Admitted => "admitted",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// State, cancellation and pool slot shared by a job's waiter and its worker
///
/// Whoever moves the state into a terminal value first owns the outcome: a
/// worker that loses the race against a timeout discards its result, a waiter
/// that loses the race collects the result instead of reporting a timeout.
///
/// The slot is handed back when a job is abandoned before it started, or
/// otherwise when its worker lets go of it. A job abandoned while running
/// keeps its slot until the converter call returns or its unit is killed.
#[derive(Debug)]
pub(crate) struct JobControl {
    state: AtomicU8,
    token: CancellationToken,
    slot: Mutex<Option<SlotPermit>>,
}

impl JobControl {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(JobState::Admitted as u8),
            token: CancellationToken::new(),
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Keep `permit` until the job lets go of its slot
    pub(crate) fn hold_slot(&self, permit: SlotPermit) {
        *self.slot.lock() = Some(permit);
    }

    /// Give the pool slot back; later calls do nothing
    pub(crate) fn release_slot(&self) {
        let permit = self.slot.lock().take();
        drop(permit);
    }

    /// Move to `next` if the current state allows it
    ///
    /// Returns the state that was replaced, or the state observed when the
    /// move was not allowed.
    pub(crate) fn transition(&self, next: JobState) -> Result<JobState, JobState> {
        let mut current = self.state();
        loop {
            if !current.can_transition_to(next) {
                return Err(current);
            }
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = JobState::from_u8(actual),
            }
        }
    }

    /// Mark the job timed out and signal cancellation
    ///
    /// Returns false when the job already reached a terminal state.
    pub(crate) fn abandon(&self, reason: CancellationReason) -> bool {
        match self.transition(JobState::TimedOut) {
            Ok(previous) => {
                // No worker ever picked it up, so nothing is using the slot
                if previous == JobState::Queued {
                    self.release_slot();
                }
                self.token.cancel_with_reason(reason);
                true
            }
            Err(_) => false,
        }
    }
}
