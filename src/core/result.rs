//! Successful conversion output

use crate::core::class::ExecutionClass;
use crate::core::job::JobId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Document metadata as reported by a converter
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Bool(bool),
    /// Integral number
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// Free text
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(v) => write!(f, "{v}"),
            MetadataValue::Integer(v) => write!(f, "{v}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Integer(v)
    }
}

impl From<usize> for MetadataValue {
    fn from(v: usize) -> Self {
        MetadataValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Text(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Text(v.to_string())
    }
}

/// Normalized text produced for one dispatched document
///
/// Owned by the caller once returned; the engine keeps no reference to it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversionResult {
    /// Job that produced this result
    pub job_id: JobId,
    /// Normalized text
    pub text: String,
    /// Document title, if the converter found one
    pub title: Option<String>,
    /// Converter supplied metadata
    pub metadata: Metadata,
    /// Time spent inside the converter
    #[serde(rename = "elapsed_ms", with = "crate::core::millis")]
    pub elapsed: Duration,
    /// Pool that ran the conversion
    pub class: ExecutionClass,
}

impl ConversionResult {
    /// Elapsed converter time in fractional seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_metadata_untagged_roundtrip() {
        let mut metadata = Metadata::new();
        metadata.insert("pages".into(), 12i64.into());
        metadata.insert("ocr".into(), true.into());
        metadata.insert("ratio".into(), 0.5f64.into());
        metadata.insert("author".into(), "Ada".into());

        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(
            json,
            r#"{"author":"Ada","ocr":true,"pages":12,"ratio":0.5}"#
        );

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_result_serializes_elapsed_in_millis() {
        let result = ConversionResult {
            job_id: Uuid::nil(),
            text: "hello".into(),
            title: None,
            metadata: Metadata::new(),
            elapsed: Duration::from_millis(1500),
            class: ExecutionClass::Light,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["elapsed_ms"], 1500);
        assert_eq!(value["class"], "light");
        assert!((result.elapsed_secs() - 1.5).abs() < f64::EPSILON);
    }
}
