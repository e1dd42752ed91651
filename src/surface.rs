//! Response shapes for an upload service in front of the engine
//!
//! Routing and request parsing belong to whatever HTTP framework hosts the
//! engine. This module only fixes the contract: which uploads are accepted,
//! what a successful conversion looks like on the wire, how a
//! [`ConversionError`] becomes a status code and JSON body, and what a health
//! probe reports.

use crate::core::class::ExecutionClass;
use crate::core::error::{ConversionError, ErrorKind};
use crate::core::result::ConversionResult;
use crate::dispatch::{DispatchEngine, EngineStatsSnapshot};
use serde::Serialize;
use std::path::Path;

/// Service name reported by [`HealthReport`]
pub const SERVICE_NAME: &str = "docdispatch";

/// Extensions accepted for upload, with the leading dot
pub const SUPPORTED_FORMATS: &[&str] = &[
    ".pdf", ".docx", ".pptx", ".xlsx", ".xls", ".doc", ".ppt", ".html", ".htm", ".jpg", ".jpeg",
    ".png", ".zip", ".csv", ".tsv", ".json", ".xml", ".txt", ".md", ".rtf", ".eml", ".msg",
];

/// Answer to a supported formats query
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SupportedFormats {
    /// Accepted extensions
    pub supported_formats: Vec<&'static str>,
    /// Number of accepted extensions
    pub count: usize,
    /// What the list means
    pub description: &'static str,
    /// Caveats
    pub note: &'static str,
}

impl SupportedFormats {
    /// The report for [`SUPPORTED_FORMATS`]
    pub fn report() -> Self {
        Self {
            supported_formats: SUPPORTED_FORMATS.to_vec(),
            count: SUPPORTED_FORMATS.len(),
            description: "File formats accepted for conversion to normalized text",
            note: "Image formats need an OCR capable converter",
        }
    }
}

/// Whether `filename` has one of the [`SUPPORTED_FORMATS`] extensions
pub fn is_supported(filename: &str) -> bool {
    extension_of(filename).is_some_and(|ext| SUPPORTED_FORMATS.contains(&ext.as_str()))
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
}

/// Check an upload before it is dispatched
///
/// # Errors
///
/// Returns [`ConversionError::CorruptInput`] for a missing filename or an
/// empty payload and [`ConversionError::UnsupportedFormat`] for an extension
/// outside [`SUPPORTED_FORMATS`].
pub fn validate_upload(filename: &str, payload: &[u8]) -> Result<(), ConversionError> {
    if filename.trim().is_empty() {
        return Err(ConversionError::corrupt_input(filename, "no filename given"));
    }
    if !is_supported(filename) {
        let found = extension_of(filename).unwrap_or_else(|| "none".to_string());
        return Err(ConversionError::unsupported_format(
            filename,
            format!(
                "unsupported extension {found}; supported: {}",
                SUPPORTED_FORMATS.join(", ")
            ),
        ));
    }
    if payload.is_empty() {
        return Err(ConversionError::corrupt_input(filename, "file is empty"));
    }
    Ok(())
}

/// Successful conversion body
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocumentOutput {
    /// Uploaded filename
    pub filename: String,
    /// Normalized text
    pub content: String,
    /// Output format, always `"markdown"`
    pub format: &'static str,
    /// Converter time in seconds
    pub processing_time: f64,
    /// Upload size in bytes
    pub file_size: u64,
}

impl DocumentOutput {
    /// Build the body for `result`
    pub fn new(filename: impl Into<String>, file_size: u64, result: ConversionResult) -> Self {
        let filename = filename.into();
        let filename = if filename.is_empty() {
            "document".to_string()
        } else {
            filename
        };
        Self {
            filename,
            processing_time: result.elapsed_secs(),
            content: result.text,
            format: "markdown",
            file_size,
        }
    }
}

/// Failure body
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Error tag
    pub error: ErrorKind,
    /// Human readable detail
    pub detail: String,
    /// Whether retrying later may succeed
    pub retryable: bool,
}

impl From<&ConversionError> for ErrorBody {
    fn from(error: &ConversionError) -> Self {
        Self {
            error: error.kind(),
            detail: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Status code and body for a failed request
pub fn error_response(error: &ConversionError) -> (u16, ErrorBody) {
    (error.http_status(), ErrorBody::from(error))
}

/// Worker counts reported by a health probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    /// Light pool threads
    pub threads: usize,
    /// Heavy pool processes
    pub processes: usize,
}

/// Health probe body
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    /// `"healthy"` while admitting, `"shutting_down"` afterwards
    pub status: &'static str,
    /// Service name
    pub service: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Pool sizes
    pub workers: WorkerCounts,
    /// Live statistics
    pub stats: EngineStatsSnapshot,
}

impl HealthReport {
    /// Probe a running engine
    pub fn from_engine(engine: &DispatchEngine) -> Self {
        Self {
            status: if engine.is_shut_down() {
                "shutting_down"
            } else {
                "healthy"
            },
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            workers: WorkerCounts {
                threads: engine.pool(ExecutionClass::Light).max_concurrency(),
                processes: engine.pool(ExecutionClass::Heavy).max_concurrency(),
            },
            stats: engine.stats(),
        }
    }

    /// HTTP status for this report
    pub fn http_status(&self) -> u16 {
        if self.status == "healthy" {
            200
        } else {
            503
        }
    }
}
