//! Daemon-side handle on one driver child process.
//!
//! The child's stdout carries driver-to-daemon frames, its stdin carries
//! daemon-to-driver frames, and it inherits descriptor 3 as a duplicate of
//! the daemon's stdout for plain-text logs.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DriverError;
use crate::codec::{CodecError, FrameReader, FrameSink, FrameWriter};
use crate::domain::{DriverMeta, DriverSource, Message};
use crate::lifecycle::Lifecycle;

/// Depth of the per-driver inbound message stream
pub const STREAM_DEPTH: usize = 10;

/// Descriptor number on which drivers find the log stream
pub const LOG_FD: i32 = 3;

/// Resolve and validate the executable for a driver.
///
/// Built-in drivers are looked up by bare name inside `driver_dir`; a name
/// containing a path separator is rejected so configuration cannot point
/// outside the trusted directory.
pub fn acquire(meta: &DriverMeta, driver_dir: &Path) -> Result<PathBuf, DriverError> {
    let path = match &meta.source {
        DriverSource::Builtin(name) => {
            if name.is_empty()
                || name == "."
                || name == ".."
                || name.contains('/')
                || name.contains('\\')
                || name.contains(std::path::MAIN_SEPARATOR)
            {
                return Err(DriverError::UnsafeName(name.clone()));
            }
            driver_dir.join(name)
        }
        DriverSource::Path(path) => path.clone(),
    };

    let metadata = std::fs::metadata(&path).map_err(|_| DriverError::NotFound(path.clone()))?;
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(DriverError::NotExecutable(path));
    }

    Ok(path)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Marshal heterogeneous config values into process arguments.
///
/// Strings pass through unquoted, `null` becomes an empty argument, and
/// everything else is written as compact JSON.
pub fn prepare(args: &[Value]) -> Vec<String> {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}

/// A running driver process
pub struct DriverHandle {
    meta: DriverMeta,
    pid: Option<u32>,
    input: FrameWriter<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    stream: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl DriverHandle {
    /// Spawn the driver as `<exe> <service> <args...>` and start pumping
    /// its output frames into the handle's stream.
    pub fn start(
        meta: &DriverMeta,
        executable: &Path,
        service: &str,
        lifecycle: &Lifecycle,
    ) -> Result<Self, DriverError> {
        let mut command = Command::new(executable);
        command
            .arg(service)
            .args(prepare(&meta.args))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        if let Err(e) = attach_log_fd(&mut command) {
            warn!(driver = %meta.name, error = %e, "driver log descriptor unavailable");
        }

        let mut child = command.spawn().map_err(|source| DriverError::Spawn {
            driver: meta.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::MissingPipe(meta.name.clone(), "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::MissingPipe(meta.name.clone(), "stdout"))?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let cancel = lifecycle.token().child_token();

        lifecycle.spawn(fetch_loop(
            meta.name.clone(),
            FrameReader::new(stdout),
            tx,
            cancel.clone(),
            lifecycle.clone(),
        ));

        info!(driver = %meta.name, pid = ?pid, exe = %executable.display(), "driver started");

        Ok(Self {
            meta: meta.clone(),
            pid,
            input: FrameWriter::new(stdin),
            child: tokio::sync::Mutex::new(child),
            stream: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn meta(&self) -> &DriverMeta {
        &self.meta
    }

    /// OS process id, if the process was still running at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the inbound stream. Only the first caller gets it.
    pub fn take_stream(&self) -> Option<mpsc::Receiver<Message>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Write one frame to the driver's stdin
    pub async fn send_message(&self, message: &Message) -> Result<(), CodecError> {
        self.input.send(message).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the fetch loop (closing the stream) and close stdin. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.input.close().await;
        debug!(driver = %self.meta.name, pid = ?self.pid, "driver handle closed");
    }

    /// Block until the process exits
    pub async fn wait(&self) -> io::Result<ExitStatus> {
        self.child.lock().await.wait().await
    }

    /// Close, give the process `grace` to exit on its own, then kill it
    pub async fn shutdown(&self, grace: Duration) -> io::Result<ExitStatus> {
        self.close().await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(driver = %self.meta.name, pid = ?self.pid, "driver ignored close, killing");
                child.start_kill()?;
                child.wait().await
            }
        }
    }
}

#[async_trait]
impl FrameSink for DriverHandle {
    async fn send_frame(&self, message: &Message) -> Result<(), CodecError> {
        self.send_message(message).await
    }
}

/// Pump frames from the driver's stdout into its stream until the stream
/// ends, the handle is closed, or the daemon shuts down.
async fn fetch_loop<R>(
    driver: String,
    mut reader: FrameReader<R>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    lifecycle: Lifecycle,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        if lifecycle.is_shutting_down() {
            break;
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = reader.fetch() => fetched,
        };

        match fetched {
            Ok(message) => {
                let delivered = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(message) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Err(e) if e.is_closed() => {
                debug!(%driver, "driver output ended");
                break;
            }
            Err(CodecError::Io(e)) => {
                warn!(%driver, error = %e, "driver output unreadable");
                break;
            }
            Err(e) => {
                warn!(%driver, error = %e, "dropping bad frame from driver");
            }
        }
    }
}

/// Give the child a duplicate of our stdout as descriptor 3
#[cfg(unix)]
fn attach_log_fd(command: &mut Command) -> io::Result<()> {
    use std::os::fd::{AsFd, AsRawFd};

    let log = io::stdout().as_fd().try_clone_to_owned()?;
    let raw = log.as_raw_fd();

    // SAFETY: the closure only calls async-signal-safe libc functions
    // (dup2, fcntl) on descriptors owned by the closure.
    unsafe {
        command.pre_exec(move || {
            let _owned = &log;
            if raw == LOG_FD {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(raw, LOG_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Ok(())
}
