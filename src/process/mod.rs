//! Process isolation for heavy jobs
//!
//! A heavy slot is backed by a `docdispatch-worker` child process that speaks
//! the framed protocol in [`protocol`] over its stdin and stdout. The worker
//! side is [`serve`]; the dispatcher side lives in `unit`.

pub mod protocol;
pub mod serve;
pub(crate) mod unit;

pub use protocol::{ProtocolError, RequestHeader, WorkerReply, WorkerRequest, MAX_FRAME_LEN};
pub use serve::serve;
