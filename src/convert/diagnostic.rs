//! Fault-injecting converter for isolation smoke tests
//!
//! Wraps another converter and reacts to directives in the filename hint:
//!
//! | filename            | behaviour                                         |
//! |---------------------|---------------------------------------------------|
//! | `*.crash`           | aborts the whole process                          |
//! | `*.panic`           | panics inside the converter                       |
//! | `*.hang`            | never returns unless its token is cancelled       |
//! | `<name>.vanish`     | converts `<name>`, then exits the process shortly |
//! | `sleep-<ms>-<name>` | sleeps `<ms>` milliseconds, then converts `<name>`|
//!
//! Anything else is passed to the inner converter unchanged. `*.crash` and
//! `*.vanish` must only be sent to a heavy pool: in a light pool it takes the dispatcher down,
//! which is exactly what the heavy pool exists to prevent.

use super::{ConversionInput, ConvertedDocument, Converter, ConverterError, PlainTextConverter};
use crate::core::cancellation::CancellationToken;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(10);
const VANISH_DELAY: Duration = Duration::from_millis(200);

/// Converter that injects crashes, panics, hangs and delays
#[derive(Clone, Debug)]
pub struct DiagnosticConverter<C = PlainTextConverter> {
    inner: C,
}

impl Default for DiagnosticConverter<PlainTextConverter> {
    fn default() -> Self {
        Self::new(PlainTextConverter::new())
    }
}

impl<C: Converter> DiagnosticConverter<C> {
    /// Wrap `inner`
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

/// Parse `sleep-<ms>-<rest>` into the delay and the remaining filename
fn parse_sleep(filename: &str) -> Option<(Duration, &str)> {
    let rest = filename.strip_prefix("sleep-")?;
    let (millis, name) = rest.split_once('-')?;
    let millis: u64 = millis.parse().ok()?;
    Some((Duration::from_millis(millis), name))
}

fn sleep_unless_cancelled(total: Duration, token: &CancellationToken) -> Result<(), ConverterError> {
    let deadline = Instant::now() + total;
    loop {
        token.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

impl<C: Converter> Converter for DiagnosticConverter<C> {
    fn convert(
        &self,
        input: &ConversionInput<'_>,
        token: &CancellationToken,
    ) -> Result<ConvertedDocument, ConverterError> {
        match input.extension().as_deref() {
            Some("crash") => {
                log::error!("diagnostic crash requested by '{}'", input.filename);
                std::process::abort();
            }
            Some("panic") => panic!("diagnostic panic requested by '{}'", input.filename),
            Some("hang") => loop {
                token.check()?;
                thread::sleep(SLEEP_SLICE);
            },
            Some("vanish") => {
                // Leave time for the reply to reach the dispatcher first
                thread::spawn(|| {
                    thread::sleep(VANISH_DELAY);
                    log::warn!("diagnostic exit after reply");
                    std::process::exit(3);
                });
                let name = input.filename.strip_suffix(".vanish").unwrap_or(input.filename);
                return self
                    .inner
                    .convert(&ConversionInput::new(input.bytes, name), token);
            }
            _ => {}
        }

        match parse_sleep(input.filename) {
            Some((delay, name)) => {
                sleep_unless_cancelled(delay, token)?;
                self.inner
                    .convert(&ConversionInput::new(input.bytes, name), token)
            }
            None => self.inner.convert(input, token),
        }
    }

    fn name(&self) -> &str {
        "DiagnosticConverter"
    }
}
