//! Driver processes.
//!
//! - [`handle`]: the daemon's side of one child process
//! - [`command`]: retry wrapper around command handlers
//! - [`sdk`]: the child's side, used to write driver binaries

pub mod command;
pub mod handle;
pub mod sdk;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

pub use command::{CommandHandler, CommandOutcome, RetryPolicy};
pub use handle::{acquire, prepare, DriverHandle, LOG_FD, STREAM_DEPTH};
pub use sdk::{Driver, DriverArgs, DriverContext};

/// Errors starting or talking to a driver process
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unsafe built-in driver name {0:?}")]
    UnsafeName(String),

    #[error("driver executable not found: {0}")]
    NotFound(PathBuf),

    #[error("driver executable is not an executable file: {0}")]
    NotExecutable(PathBuf),

    #[error("failed to spawn driver {driver}: {source}")]
    Spawn {
        driver: String,
        #[source]
        source: io::Error,
    },

    #[error("driver {0} has no {1} pipe")]
    MissingPipe(String, &'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
