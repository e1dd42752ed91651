//! Worker side of the process protocol

use crate::convert::{ConversionInput, Converter};
use crate::core::cancellation::CancellationToken;
use crate::process::protocol::{read_request, write_reply, ProtocolError, WorkerReply};
use std::io::{Read, Write};
use std::time::Instant;

/// Answer conversion requests from `reader` until it reaches end of stream
///
/// Runs one conversion at a time. Panics are not caught: a converter that
/// panics or aborts takes the worker process down, and the supervisor on the
/// other end reports the job as a converter failure and starts a new worker.
///
/// Returns the number of requests served.
///
/// # Errors
///
/// Returns a [`ProtocolError`] if a request is malformed or the reply pipe
/// is closed.
pub fn serve<C, R, W>(converter: &C, mut reader: R, mut writer: W) -> Result<u64, ProtocolError>
where
    C: Converter + ?Sized,
    R: Read,
    W: Write,
{
    let token = CancellationToken::new();
    let mut served = 0u64;

    while let Some(request) = read_request(&mut reader)? {
        log::debug!(
            "converting job {} '{}' ({} bytes) with {}",
            request.header.job_id,
            request.header.filename,
            request.payload.len(),
            converter.name()
        );

        let input = ConversionInput::new(&request.payload, &request.header.filename);
        let start = Instant::now();
        let reply = match converter.convert(&input, &token) {
            Ok(document) => WorkerReply::converted(document, start.elapsed()),
            Err(e) => {
                log::warn!("job {} failed: {}", request.header.job_id, e);
                WorkerReply::failed(e)
            }
        };

        write_reply(&mut writer, &reply)?;
        served += 1;
    }

    log::debug!("request stream closed after {} jobs", served);
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{FailureKind, PlainTextConverter};
    use crate::process::protocol::{read_reply, write_request};
    use std::io::Cursor;
    use uuid::Uuid;

    #[test]
    fn test_serve_answers_each_request() {
        let mut requests = Vec::new();
        write_request(&mut requests, Uuid::new_v4(), "a.txt", b"first").unwrap();
        write_request(&mut requests, Uuid::new_v4(), "b.bin", b"\x00\x01").unwrap();

        let mut replies = Vec::new();
        let served = serve(
            &PlainTextConverter::new(),
            Cursor::new(requests),
            &mut replies,
        )
        .unwrap();
        assert_eq!(served, 2);

        let mut reader = Cursor::new(replies);
        match read_reply(&mut reader).unwrap().unwrap() {
            WorkerReply::Converted { text, title, .. } => {
                assert_eq!(text, "first");
                assert_eq!(title.as_deref(), Some("a"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        match read_reply(&mut reader).unwrap().unwrap() {
            WorkerReply::Failed { kind, .. } => assert_eq!(kind, FailureKind::UnsupportedFormat),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(read_reply(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_serve_empty_stream() {
        let served = serve(&PlainTextConverter::new(), Cursor::new(Vec::new()), Vec::new()).unwrap();
        assert_eq!(served, 0);
    }

    #[test]
    fn test_serve_rejects_garbage() {
        let mut requests = 8u32.to_be_bytes().to_vec();
        requests.extend_from_slice(b"garbage!");
        let err = serve(&PlainTextConverter::new(), Cursor::new(requests), Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
