//! Convenient re-exports for common types and traits

pub use crate::convert::{
    ConversionInput, ConvertedDocument, Converter, ConverterError, FailureKind, PlainTextConverter,
};
pub use crate::core::{
    CancellationToken, ConversionError, ConversionResult, EngineError, ExecutionClass, Result,
};
pub use crate::dispatch::{DispatchEngine, EngineConfig, WorkerCommand};
pub use crate::pool::{JobTicket, WorkerPool};
