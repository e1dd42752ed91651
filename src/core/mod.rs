//! Core types shared by the pools and the dispatcher

pub mod cancellation;
pub mod class;
pub mod error;
pub mod job;
pub(crate) mod millis;
pub mod result;

pub use cancellation::{CancellationCallbackGuard, CancellationReason, CancellationToken};
pub use class::{ExecutionClass, SizeClassifier, DEFAULT_SIZE_THRESHOLD};
pub use error::{ConversionError, EngineError, ErrorKind, Result};
pub use job::{ConversionJob, JobId, JobState};
pub use result::{ConversionResult, Metadata, MetadataValue};
