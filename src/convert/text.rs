//! Plain text pass-through converter
//!
//! Handles the text-based formats of the upload surface without any parsing
//! library: decodes UTF-8, drops a byte order mark and normalizes line endings.
//! Binary formats are reported as unsupported so that a real conversion
//! library can be plugged in for them.

use super::{ConversionInput, ConvertedDocument, Converter, ConverterError};
use crate::core::cancellation::CancellationToken;
use std::path::Path;

/// Extensions handled by [`PlainTextConverter`]
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "tsv", "json", "xml", "html", "htm"];

const BOM: &str = "\u{feff}";

/// Converter for UTF-8 text documents
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTextConverter;

impl PlainTextConverter {
    /// Create the converter
    pub fn new() -> Self {
        Self
    }

    fn title_for(extension: &str, text: &str, filename: &str) -> Option<String> {
        let found = match extension {
            "md" => markdown_heading(text),
            "html" | "htm" => html_title(text),
            _ => None,
        };
        found.or_else(|| {
            Path::new(filename)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| !stem.is_empty())
                .map(str::to_string)
        })
    }
}

impl Converter for PlainTextConverter {
    fn convert(
        &self,
        input: &ConversionInput<'_>,
        token: &CancellationToken,
    ) -> Result<ConvertedDocument, ConverterError> {
        let extension = input.extension().ok_or_else(|| {
            ConverterError::unsupported_format(format!(
                "cannot determine format of '{}'",
                input.filename
            ))
        })?;

        if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ConverterError::unsupported_format(format!(
                ".{extension} is not a text format"
            )));
        }

        let decoded = std::str::from_utf8(input.bytes).map_err(|e| {
            ConverterError::corrupt_input(format!("payload is not valid UTF-8: {e}"))
        })?;
        token.check()?;

        let text = normalize_newlines(decoded.strip_prefix(BOM).unwrap_or(decoded));
        let line_count = text.lines().count();
        let title = Self::title_for(&extension, &text, input.filename);

        let mut document = ConvertedDocument::new(text)
            .with_metadata("extension", extension)
            .with_metadata("line_count", line_count)
            .with_metadata("byte_len", input.bytes.len());
        document.title = title;
        Ok(document)
    }

    fn name(&self) -> &str {
        "PlainTextConverter"
    }
}

fn normalize_newlines(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn markdown_heading(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim_start)
        .find(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
}

fn html_title(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = text[start..end].trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::FailureKind;
    use crate::core::result::MetadataValue;

    fn convert(bytes: &[u8], filename: &str) -> Result<ConvertedDocument, ConverterError> {
        PlainTextConverter::new().convert(
            &ConversionInput::new(bytes, filename),
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_text_passthrough() {
        let doc = convert(b"hello\nworld\n", "notes.txt").unwrap();
        assert_eq!(doc.text, "hello\nworld\n");
        assert_eq!(doc.title.as_deref(), Some("notes"));
        assert_eq!(
            doc.metadata.get("line_count"),
            Some(&MetadataValue::Integer(2))
        );
        assert_eq!(
            doc.metadata.get("extension"),
            Some(&MetadataValue::Text("txt".into()))
        );
    }

    #[test]
    fn test_bom_and_crlf_normalized() {
        let doc = convert("\u{feff}a\r\nb\rc".as_bytes(), "data.csv").unwrap();
        assert_eq!(doc.text, "a\nb\nc");
    }

    #[test]
    fn test_markdown_title() {
        let doc = convert(b"intro\n\n## Quarterly Report \nbody", "r.md").unwrap();
        assert_eq!(doc.title.as_deref(), Some("Quarterly Report"));
    }

    #[test]
    fn test_html_title() {
        let doc = convert(
            b"<html><head><TITLE> Status Page </TITLE></head></html>",
            "index.HTML",
        )
        .unwrap();
        assert_eq!(doc.title.as_deref(), Some("Status Page"));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let err = convert(&[0xff, 0xfe, 0x00, 0x41], "a.txt").unwrap_err();
        assert_eq!(err.kind, FailureKind::CorruptInput);
    }

    #[test]
    fn test_binary_formats_unsupported() {
        let err = convert(b"%PDF-1.7", "scan.pdf").unwrap_err();
        assert_eq!(err.kind, FailureKind::UnsupportedFormat);

        let err = convert(b"abc", "no_extension").unwrap_err();
        assert_eq!(err.kind, FailureKind::UnsupportedFormat);
    }

    #[test]
    fn test_cancelled_token_stops_conversion() {
        let token = CancellationToken::new();
        token.cancel();
        let err = PlainTextConverter::new()
            .convert(&ConversionInput::new(b"abc", "a.txt"), &token)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Other);
    }
}
