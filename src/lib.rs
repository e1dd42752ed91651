//! # docdispatch
//!
//! A job dispatch engine for document conversion services. Each uploaded
//! document is routed by size to one of two pools with separate concurrency
//! limits, so that large or slow conversions cannot starve small ones.
//!
//! ## Features
//!
//! - **Size routing**: payloads below a threshold (1 MiB by default) go to the
//!   light pool, everything else to the heavy pool
//! - **Light pool**: many threads sharing memory, panics captured per job
//! - **Heavy pool**: a few worker processes; a crashing or hung converter only
//!   costs its own job and the process is replaced
//! - **Backpressure**: `C` running plus `Q` queued jobs per pool, anything
//!   beyond fails fast with `Overloaded`
//! - **Deadlines**: every dispatch has a timeout; abandoned heavy jobs are
//!   killed, abandoned light jobs see their cancellation token fire
//! - **Closed error set**: every failure maps to exactly one of
//!   `UnsupportedFormat`, `CorruptInput`, `Timeout`, `ConverterFailure`,
//!   `Overloaded`
//!
//! ## Quick Start
//!
//! ```rust
//! use docdispatch::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> docdispatch::Result<()> {
//! let config = EngineConfig::default()
//!     .with_light_workers(4)
//!     .with_heavy_workers(1)
//!     .with_worker_command(WorkerCommand::new("docdispatch-worker"));
//! let engine = DispatchEngine::new(config, Arc::new(PlainTextConverter::new()))?;
//!
//! match engine.dispatch(b"# Notes\nhello".to_vec(), "notes.md", Some(Duration::from_secs(5))) {
//!     Ok(result) => assert_eq!(result.title.as_deref(), Some("Notes")),
//!     Err(e) => eprintln!("{} -> HTTP {}", e, e.http_status()),
//! }
//!
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Converters
//!
//! ```rust
//! use docdispatch::prelude::*;
//! use std::sync::Arc;
//!
//! struct Shouting;
//!
//! impl Converter for Shouting {
//!     fn convert(
//!         &self,
//!         input: &ConversionInput<'_>,
//!         token: &CancellationToken,
//!     ) -> std::result::Result<ConvertedDocument, ConverterError> {
//!         token.check()?;
//!         let text = std::str::from_utf8(input.bytes)
//!             .map_err(|e| ConverterError::corrupt_input(e.to_string()))?;
//!         Ok(ConvertedDocument::new(text.to_uppercase()))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "Shouting"
//!     }
//! }
//!
//! # fn main() -> docdispatch::Result<()> {
//! let engine = DispatchEngine::new(
//!     EngineConfig::default().with_light_workers(1).with_heavy_workers(1),
//!     Arc::new(Shouting),
//! )?;
//! let result = engine.dispatch(b"quiet".to_vec(), "a.txt", None).unwrap();
//! assert_eq!(result.text, "QUIET");
//! # engine.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! Heavy jobs run in `docdispatch-worker` processes (built with the `cli`
//! feature), which host their own converter and speak the protocol in
//! [`process::protocol`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod convert;
pub mod core;
pub mod dispatch;
pub mod pool;
pub mod prelude;
pub mod process;
pub mod surface;
#[cfg(feature = "tracing")]
pub mod tracing;

pub use crate::convert::{
    ConversionInput, ConvertedDocument, Converter, ConverterError, DiagnosticConverter,
    FailureKind, PlainTextConverter,
};
pub use crate::core::{
    CancellationReason, CancellationToken, ConversionError, ConversionJob, ConversionResult,
    EngineError, ErrorKind, ExecutionClass, JobId, JobState, Metadata, MetadataValue, Result,
    SizeClassifier, DEFAULT_SIZE_THRESHOLD,
};
pub use crate::dispatch::{DispatchEngine, EngineConfig, EngineStatsSnapshot, WorkerCommand};
pub use crate::pool::{JobTicket, PoolStatsSnapshot, WorkerPool};
