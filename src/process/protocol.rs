//! Wire protocol between a heavy pool supervisor and its worker process
//!
//! Every message is a frame: a big-endian `u32` length followed by that many
//! bytes. A request is a JSON [`RequestHeader`] frame followed by one raw
//! payload frame; a reply is a single JSON [`WorkerReply`] frame. End of
//! stream at a frame boundary means the peer closed the connection cleanly.

use crate::convert::{ConvertedDocument, ConverterError, FailureKind};
use crate::core::job::JobId;
use crate::core::result::Metadata;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Largest frame accepted by either side (1 GiB)
pub const MAX_FRAME_LEN: u32 = 1 << 30;

/// Errors raised while reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Underlying pipe failure
    #[error("worker pipe error: {0}")]
    Io(#[from] io::Error),

    /// A frame did not hold the expected JSON
    #[error("malformed worker message: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame announced more bytes than allowed
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced length
        len: u64,
        /// Allowed maximum
        max: u32,
    },

    /// The stream ended in the middle of a message
    #[error("worker stream ended mid-message")]
    UnexpectedEof,
}

/// Describes the payload frame that follows it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Job being converted
    pub job_id: JobId,
    /// Filename hint
    pub filename: String,
    /// Length of the payload frame
    pub payload_len: u64,
}

/// A fully read request
#[derive(Debug)]
pub struct WorkerRequest {
    /// Request header
    pub header: RequestHeader,
    /// Raw document bytes
    pub payload: Vec<u8>,
}

/// Worker answer to one request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The converter produced a document
    Converted {
        /// Normalized text
        text: String,
        /// Title, if found
        title: Option<String>,
        /// Converter metadata
        #[serde(default)]
        metadata: Metadata,
        /// Time spent in the converter
        elapsed_ms: u64,
    },
    /// The converter reported a failure
    Failed {
        /// Declared failure category
        kind: FailureKind,
        /// Converter message
        message: String,
    },
}

impl WorkerReply {
    /// Reply for a successful conversion
    pub fn converted(document: ConvertedDocument, elapsed: Duration) -> Self {
        WorkerReply::Converted {
            text: document.text,
            title: document.title,
            metadata: document.metadata,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Reply for a converter failure
    pub fn failed(error: ConverterError) -> Self {
        WorkerReply::Failed {
            kind: error.kind,
            message: error.message,
        }
    }
}

fn write_frame<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(ProtocolError::FrameTooLarge {
            len: bytes.len() as u64,
            max: MAX_FRAME_LEN,
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Fill `buf`, returning false on a clean EOF before the first byte
fn read_exact_or_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<bool, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(ProtocolError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: u64::from(len),
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len as usize];
    if !read_exact_or_eof(reader, &mut body)? && len > 0 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(Some(body))
}

/// Send one conversion request
///
/// # Errors
///
/// Fails if the pipe is closed or the payload exceeds [`MAX_FRAME_LEN`].
pub fn write_request<W: Write + ?Sized>(
    writer: &mut W,
    job_id: JobId,
    filename: &str,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let header = RequestHeader {
        job_id,
        filename: filename.to_string(),
        payload_len: payload.len() as u64,
    };
    write_frame(writer, &serde_json::to_vec(&header)?)?;
    write_frame(writer, payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one conversion request, `None` on clean end of stream
///
/// # Errors
///
/// Fails on pipe errors, malformed headers or a truncated payload.
pub fn read_request<R: Read + ?Sized>(reader: &mut R) -> Result<Option<WorkerRequest>, ProtocolError> {
    let Some(header_bytes) = read_frame(reader)? else {
        return Ok(None);
    };
    let header: RequestHeader = serde_json::from_slice(&header_bytes)?;

    let payload = read_frame(reader)?.ok_or(ProtocolError::UnexpectedEof)?;
    if payload.len() as u64 != header.payload_len {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(Some(WorkerRequest { header, payload }))
}

/// Send one reply
///
/// # Errors
///
/// Fails if the pipe is closed.
pub fn write_reply<W: Write + ?Sized>(writer: &mut W, reply: &WorkerReply) -> Result<(), ProtocolError> {
    write_frame(writer, &serde_json::to_vec(reply)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one reply, `None` on clean end of stream
///
/// # Errors
///
/// Fails on pipe errors, malformed replies or a truncated frame.
pub fn read_reply<R: Read + ?Sized>(reader: &mut R) -> Result<Option<WorkerReply>, ProtocolError> {
    match read_frame(reader)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
