//! Execution classes and the size classifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default size threshold separating light and heavy jobs (1 MiB)
pub const DEFAULT_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// The execution context a conversion job is routed to
///
/// Light jobs run on threads sharing the dispatcher's memory. Heavy jobs run in
/// isolated worker processes so that a misbehaving converter cannot take the
/// dispatcher down with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionClass {
    /// Small payloads, thread-backed pool
    Light,
    /// Large payloads, process-backed pool
    Heavy,
}

impl ExecutionClass {
    /// All execution classes, light first
    pub fn all() -> &'static [ExecutionClass] {
        &[ExecutionClass::Light, ExecutionClass::Heavy]
    }

    /// Lowercase name used in logs and wire formats
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionClass::Light => "light",
            ExecutionClass::Heavy => "heavy",
        }
    }
}

impl fmt::Display for ExecutionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a payload length to an [`ExecutionClass`]
///
/// Classification is a pure function of the byte length: anything strictly
/// below the threshold is light, anything at or above it is heavy.
///
/// # Example
///
/// ```rust
/// use docdispatch::{ExecutionClass, SizeClassifier};
///
/// let classifier = SizeClassifier::new(1024);
/// assert_eq!(classifier.classify(1023), ExecutionClass::Light);
/// assert_eq!(classifier.classify(1024), ExecutionClass::Heavy);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassifier {
    threshold: u64,
}

impl SizeClassifier {
    /// Create a classifier with the given threshold in bytes
    pub const fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    /// The threshold in bytes
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Classify a payload by its length in bytes
    #[inline]
    pub fn classify(&self, byte_len: u64) -> ExecutionClass {
        if byte_len < self.threshold {
            ExecutionClass::Light
        } else {
            ExecutionClass::Heavy
        }
    }
}

impl Default for SizeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_THRESHOLD)
    }
}
