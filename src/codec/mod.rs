//! Framed wire codec for driver pipes.
//!
//! One frame is an ASCII header line followed by length-prefixed labels
//! and a binary payload:
//!
//! ```text
//! <channel> <subject> <numLabels> <size>\n
//! [ <labelName> <labelByteLen>\n<labelBytes> ]*
//! <size bytes of payload>
//! ```
//!
//! [`FrameWriter`] serializes whole frames under a lock owned by the
//! writer, so concurrent senders never interleave. [`FrameReader`] parses
//! frames back. End of stream at a frame boundary (or writing to a closed
//! pipe) is reported as [`CodecError::Closed`], which callers treat as an
//! orderly shutdown; everything else is a protocol error.

mod frame;

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Message;

pub use frame::{encode_frame, FrameReader, FrameWriter};

/// Longest accepted header or label line, in bytes
pub const MAX_LINE_BYTES: usize = 4096;

/// Largest accepted label count per frame
pub const MAX_LABELS: usize = 1024;

/// Largest accepted payload or label value, in bytes
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Errors produced while sending or fetching frames
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the stream (expected at shutdown)
    #[error("stream ended")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The stream ended in the middle of a frame
    #[error("truncated frame: {0}")]
    Truncated(String),

    #[error("invalid routing token {0:?}: must be non-empty and contain no whitespace")]
    InvalidToken(String),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the stream simply ended rather than carrying bad data
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Map a write-side IO error, folding "pipe already closed" into `Closed`
    pub(crate) fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

/// Anything a frame can be sent to: a pipe writer, a driver handle, ...
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, message: &Message) -> Result<(), CodecError>;
}
