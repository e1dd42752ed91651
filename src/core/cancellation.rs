//! Cooperative cancellation for conversion jobs
//!
//! Every admitted job owns a [`CancellationToken`]. The dispatcher cancels it
//! when the caller stops waiting (deadline reached, client gone, engine
//! shutting down). Heavy pool supervisors react by killing the job's worker
//! process; light pool converters can only observe the token and return early.
//!
//! # Example
//!
//! ```rust
//! use docdispatch::{CancellationReason, CancellationToken};
//! use std::time::Duration;
//!
//! let token = CancellationToken::new();
//! let seen_by_job = token.clone();
//!
//! token.cancel_with_reason(CancellationReason::Timeout(Duration::from_secs(30)));
//!
//! assert!(seen_by_job.is_cancelled());
//! assert_eq!(
//!     seen_by_job.reason(),
//!     Some(CancellationReason::Timeout(Duration::from_secs(30)))
//! );
//! ```

use crate::convert::ConverterError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_CALLBACK_ID: AtomicUsize = AtomicUsize::new(1);

/// Generates a unique callback ID
fn next_callback_id() -> usize {
    NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Reason for cancellation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// Explicitly cancelled via `cancel()`
    Manual,
    /// The caller's deadline expired
    Timeout(Duration),
    /// The caller went away (client disconnect, dropped future)
    CallerCancelled,
    /// The engine is shutting down and the drain grace period ran out
    Shutdown,
    /// Custom cancellation reason
    Custom(String),
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::Manual => write!(f, "manually cancelled"),
            CancellationReason::Timeout(d) => write!(f, "timeout after {:?}", d),
            CancellationReason::CallerCancelled => write!(f, "caller cancelled"),
            CancellationReason::Shutdown => write!(f, "engine shutting down"),
            CancellationReason::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

/// Stored callback with its ID for later removal
struct StoredCallback {
    id: usize,
    callback: Box<dyn FnOnce() + Send + Sync>,
}

struct CancellationTokenInner {
    cancelled: AtomicBool,
    callbacks: RwLock<Vec<StoredCallback>>,
    reason: RwLock<Option<CancellationReason>>,
}

/// A thread-safe cancellation flag shared between a job and its waiter
///
/// Cloning is cheap; all clones observe the same state. Cancellation is
/// one-way: once cancelled a token stays cancelled and keeps the first reason.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("callbacks", &self.inner.callbacks.read().len())
            .finish()
    }
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationTokenInner {
                cancelled: AtomicBool::new(false),
                callbacks: RwLock::new(Vec::new()),
                reason: RwLock::new(None),
            }),
        }
    }

    /// Cancel this token with default reason (Manual)
    pub fn cancel(&self) {
        self.cancel_with_reason(CancellationReason::Manual);
    }

    /// Cancel this token with a specific reason
    ///
    /// Runs every registered callback. Only the first call has an effect.
    pub fn cancel_with_reason(&self, reason: CancellationReason) {
        {
            // Anyone who sees the flag finds the reason already in place
            let mut stored = self.inner.reason.write();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return;
            }
            *stored = Some(reason);
            self.inner.cancelled.store(true, Ordering::Release);
        }

        let callbacks: Vec<_> = self.inner.callbacks.write().drain(..).collect();
        for stored in callbacks {
            (stored.callback)();
        }
    }

    /// Check if this token has been cancelled
    ///
    /// Lock-free, suitable for frequent checks inside converter loops.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason (if cancelled)
    pub fn reason(&self) -> Option<CancellationReason> {
        self.inner.reason.read().clone()
    }

    /// Returns a converter error if cancelled, `Ok(())` otherwise
    ///
    /// Lets converters bail out with `?`:
    ///
    /// ```rust
    /// use docdispatch::{CancellationToken, ConverterError};
    ///
    /// fn convert_pages(token: &CancellationToken) -> Result<String, ConverterError> {
    ///     let mut out = String::new();
    ///     for page in 0..100 {
    ///         token.check()?;
    ///         out.push_str(&format!("page {page}\n"));
    ///     }
    ///     Ok(out)
    /// }
    /// ```
    pub fn check(&self) -> std::result::Result<(), ConverterError> {
        if self.is_cancelled() {
            let reason = self
                .reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Err(ConverterError::other(format!("cancelled: {reason}")))
        } else {
            Ok(())
        }
    }

    /// Registers a callback to run when cancelled
    ///
    /// Returns a guard that unregisters the callback when dropped. If the
    /// token is already cancelled the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F) -> CancellationCallbackGuard
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let id = next_callback_id();

        if self.is_cancelled() {
            callback();
        } else {
            let mut callbacks = self.inner.callbacks.write();
            // Re-check under the lock: cancel_with_reason drains after setting the flag
            if self.is_cancelled() {
                drop(callbacks);
                callback();
            } else {
                callbacks.push(StoredCallback {
                    id,
                    callback: Box::new(callback),
                });
            }
        }

        CancellationCallbackGuard {
            token: Some(self.clone()),
            callback_id: id,
        }
    }

    fn remove_callback(&self, callback_id: usize) {
        self.inner.callbacks.write().retain(|c| c.id != callback_id);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that unregisters a callback when dropped
pub struct CancellationCallbackGuard {
    token: Option<CancellationToken>,
    callback_id: usize,
}

impl Drop for CancellationCallbackGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if !token.is_cancelled() {
                token.remove_callback(self.callback_id);
            }
        }
    }
}

impl CancellationCallbackGuard {
    /// Keep the callback registered after the guard is dropped
    pub fn detach(mut self) {
        self.token = None;
    }
}
