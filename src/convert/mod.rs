//! The converter boundary
//!
//! A [`Converter`] is the opaque collaborator that turns raw bytes into
//! normalized text. The engine never looks inside: it only decides where the
//! converter runs and how long it may take.
//!
//! The same converter type can run in a light pool thread or inside a
//! `docdispatch-worker` process for heavy jobs, so implementations must be
//! `Send + Sync` and must not rely on dispatcher-side state.
//!
//! Closures work as converters:
//!
//! ```rust
//! use docdispatch::{CancellationToken, ConversionInput, ConvertedDocument, Converter, ConverterError};
//!
//! let upper = |input: &ConversionInput<'_>, _token: &CancellationToken| {
//!     let text = std::str::from_utf8(input.bytes)
//!         .map_err(|e| ConverterError::corrupt_input(e.to_string()))?;
//!     Ok::<_, ConverterError>(ConvertedDocument::new(text.to_uppercase()))
//! };
//!
//! let doc = upper
//!     .convert(&ConversionInput::new(b"abc", "a.txt"), &CancellationToken::new())
//!     .unwrap();
//! assert_eq!(doc.text, "ABC");
//! ```

pub mod diagnostic;
pub mod text;

pub use diagnostic::DiagnosticConverter;
pub use text::PlainTextConverter;

use crate::core::cancellation::CancellationToken;
use crate::core::result::{Metadata, MetadataValue};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Borrowed input handed to a converter
#[derive(Clone, Copy, Debug)]
pub struct ConversionInput<'a> {
    /// Raw document bytes
    pub bytes: &'a [u8],
    /// Filename hint supplied by the uploader
    pub filename: &'a str,
}

impl<'a> ConversionInput<'a> {
    /// Create an input view
    pub fn new(bytes: &'a [u8], filename: &'a str) -> Self {
        Self { bytes, filename }
    }

    /// Lowercase extension of the filename hint, without the dot
    pub fn extension(&self) -> Option<String> {
        Path::new(self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// What a converter returns on success
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    /// Normalized text
    pub text: String,
    /// Title, if one was found
    pub title: Option<String>,
    /// Extra metadata
    pub metadata: Metadata,
}

impl ConvertedDocument {
    /// A document with text only
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Set the title
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Add a metadata entry
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Category a converter declares for its failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The format is not handled
    UnsupportedFormat,
    /// The payload is malformed
    CorruptInput,
    /// Anything else
    Other,
}

/// Failure reported by a converter
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ConverterError {
    /// Declared failure category
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
}

impl ConverterError {
    /// Create an error with an explicit category
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The format is not handled
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnsupportedFormat, message)
    }

    /// The payload is malformed
    pub fn corrupt_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CorruptInput, message)
    }

    /// Unclassified failure
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

/// Turns raw document bytes into normalized text
pub trait Converter: Send + Sync {
    /// Convert one document
    ///
    /// `token` is cancelled when the caller stops waiting. Long running
    /// converters should poll it and return early; the engine cannot
    /// interrupt a converter running on a light pool thread.
    ///
    /// # Errors
    ///
    /// Returns a [`ConverterError`] whose [`FailureKind`] decides which
    /// [`ConversionError`](crate::ConversionError) the caller sees.
    fn convert(
        &self,
        input: &ConversionInput<'_>,
        token: &CancellationToken,
    ) -> Result<ConvertedDocument, ConverterError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "Converter"
    }
}

impl<F> Converter for F
where
    F: Fn(&ConversionInput<'_>, &CancellationToken) -> Result<ConvertedDocument, ConverterError>
        + Send
        + Sync,
{
    fn convert(
        &self,
        input: &ConversionInput<'_>,
        token: &CancellationToken,
    ) -> Result<ConvertedDocument, ConverterError> {
        self(input, token)
    }

    fn name(&self) -> &str {
        "ClosureConverter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_is_lowercased() {
        let input = ConversionInput::new(b"", "Report.PDF");
        assert_eq!(input.extension().as_deref(), Some("pdf"));

        let input = ConversionInput::new(b"", "README");
        assert_eq!(input.extension(), None);
    }

    #[test]
    fn test_document_builder() {
        let doc = ConvertedDocument::new("body")
            .with_title("Title")
            .with_metadata("pages", 3i64);
        assert_eq!(doc.title.as_deref(), Some("Title"));
        assert_eq!(doc.metadata.get("pages"), Some(&MetadataValue::Integer(3)));
    }

    #[test]
    fn test_closure_converter() {
        let converter = |input: &ConversionInput<'_>, _: &CancellationToken| {
            if input.bytes.is_empty() {
                Err(ConverterError::corrupt_input("empty"))
            } else {
                Ok(ConvertedDocument::new("ok"))
            }
        };

        let token = CancellationToken::new();
        assert!(converter
            .convert(&ConversionInput::new(b"x", "a.txt"), &token)
            .is_ok());
        let err = converter
            .convert(&ConversionInput::new(b"", "a.txt"), &token)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::CorruptInput);
        assert_eq!(converter.name(), "ClosureConverter");
    }

    #[test]
    fn test_converter_error_wire_format() {
        let err = ConverterError::unsupported_format("no handler for .xyz");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"unsupported_format","message":"no handler for .xyz"}"#
        );
    }
}
