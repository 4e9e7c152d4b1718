//! Config file watcher.
//!
//! Watches the directory holding the config file and reports a change
//! whenever the file's content hash differs from the last one seen, so
//! editor save dances (rename, truncate, write) produce one event.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::new_debouncer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Config file has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// A new version of the config file
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,

    /// SHA256 of the file content, hex encoded
    pub hash: String,

    pub detected_at: DateTime<Utc>,
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.task.await?;
        Ok(())
    }
}

/// Hash a file's content; `None` when it cannot be read
pub fn file_hash(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

/// Start watching `path`. Changes arrive on the returned channel.
pub fn watch(
    path: &Path,
    debounce: Duration,
) -> Result<(mpsc::Receiver<ConfigChange>, WatchHandle), WatcherError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| WatcherError::NoParent(path.to_path_buf()))?
        .to_path_buf();
    let path = path.to_path_buf();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(debounce, tx)?;
    debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;

    let (change_tx, change_rx) = mpsc::channel(8);
    let stop = Arc::new(AtomicBool::new(false));
    let stopped = stop.clone();

    let task = tokio::task::spawn_blocking(move || {
        // keep the debouncer alive for the life of the loop
        let _debouncer = debouncer;
        let mut last_hash = file_hash(&path);

        tracing::info!(path = %path.display(), "watching config file");

        while !stopped.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(events)) => {
                    if !events.iter().any(|e| e.path.file_name() == path.file_name()) {
                        continue;
                    }

                    let hash = file_hash(&path);
                    if hash.is_none() || hash == last_hash {
                        continue;
                    }
                    last_hash = hash.clone();

                    let change = ConfigChange {
                        path: path.clone(),
                        hash: hash.unwrap_or_default(),
                        detected_at: Utc::now(),
                    };
                    tracing::info!(path = %path.display(), hash = %change.hash, "config file changed");
                    if change_tx.blocking_send(change).is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = ?e, "config watcher error");
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    tracing::error!("config watcher channel disconnected");
                    break;
                }
            }
        }

        tracing::debug!("config watcher stopped");
    });

    Ok((change_rx, WatchHandle { stop, task }))
}
