//! Capture engine: one handle over the configured capture strategy.
//!
//! Both strategies run as single-owner tasks. A caller's request becomes a
//! waiter inside the task; the caller waits on its own timeout, so giving up
//! never cancels the capture that is already under way.

pub mod link_watch;
pub mod motion_loop;
pub mod snapshot;
pub mod waiters;

use crate::metrics::WAITER_TIMEOUTS;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use treat_core::capture_name::{self, CaptureNameError, CaptureRecord};
use treat_core::config::{CaptureConfig, CaptureStrategy};

pub use motion_loop::{spawn_motion, MotionHandle, MotionStatus};
pub use snapshot::{spawn_snapshot, SnapshotHandle};

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("snapshot trigger failed: {0}")]
    Trigger(String),

    #[error("capture process failed: {0}")]
    Process(String),

    #[error(transparent)]
    BadName(#[from] CaptureNameError),

    #[error("timed out waiting for a capture")]
    Timeout,

    #[error("image capture is disabled")]
    Disabled,

    #[error("motion capture is not available with the {0:?} strategy")]
    MotionUnsupported(CaptureStrategy),

    #[error("capture task is no longer running")]
    Closed,

    #[error("capture directory error: {0}")]
    Io(String),
}

pub type CaptureResult = Result<String, CaptureError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Completed { name: String, waiters: usize },
    Failed { reason: String },
}

/// Wait for a queued capture on the caller's own deadline.
pub(crate) async fn await_capture(
    rx: oneshot::Receiver<CaptureResult>,
    timeout: Duration,
) -> CaptureResult {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CaptureError::Closed),
        Err(_) => {
            WAITER_TIMEOUTS.inc();
            Err(CaptureError::Timeout)
        }
    }
}

/// Run retention off the async threads.
pub(crate) async fn trim_captures(dir: PathBuf, retain: usize) -> Result<Vec<String>, CaptureError> {
    tokio::task::spawn_blocking(move || capture_name::trim_excess_captures(&dir, retain))
        .await
        .map_err(|e| CaptureError::Io(e.to_string()))?
        .map_err(|e| CaptureError::Io(e.to_string()))
}

pub(crate) fn spawn_trim(dir: PathBuf, retain: usize) {
    tokio::spawn(async move {
        if let Err(e) = trim_captures(dir, retain).await {
            warn!(error = %e, "capture retention failed");
        }
    });
}

#[derive(Clone)]
pub enum CaptureHandle {
    Snapshot(SnapshotHandle),
    Motion(MotionHandle),
    Disabled {
        last: Option<CaptureRecord>,
        dir: PathBuf,
        retain: usize,
    },
}

impl CaptureHandle {
    pub fn strategy(&self) -> CaptureStrategy {
        match self {
            Self::Snapshot(_) => CaptureStrategy::Snapshot,
            Self::Motion(_) => CaptureStrategy::Motion,
            Self::Disabled { .. } => CaptureStrategy::Disabled,
        }
    }

    /// Resolves with the name of the next completed capture.
    pub async fn capture_photo(&self) -> CaptureResult {
        match self {
            Self::Snapshot(h) => h.capture_photo().await,
            Self::Motion(h) => h.capture_photo().await,
            Self::Disabled { .. } => Err(CaptureError::Disabled),
        }
    }

    pub async fn last_capture(&self) -> Result<Option<CaptureRecord>, CaptureError> {
        match self {
            Self::Snapshot(h) => h.last_capture().await,
            Self::Motion(h) => h.last_capture().await,
            Self::Disabled { last, .. } => Ok(last.clone()),
        }
    }

    pub async fn trim_excess_captures(&self) -> Result<Vec<String>, CaptureError> {
        match self {
            Self::Snapshot(h) => h.trim_excess_captures().await,
            Self::Motion(h) => h.trim_excess_captures().await,
            Self::Disabled { dir, retain, .. } => trim_captures(dir.clone(), *retain).await,
        }
    }

    pub async fn start_motion(&self) -> Result<MotionStatus, CaptureError> {
        match self {
            Self::Motion(h) => h.start_motion().await,
            other => Err(CaptureError::MotionUnsupported(other.strategy())),
        }
    }

    pub async fn stop_motion(&self) -> Result<MotionStatus, CaptureError> {
        match self {
            Self::Motion(h) => h.stop_motion().await,
            other => Err(CaptureError::MotionUnsupported(other.strategy())),
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<CaptureEvent>> {
        match self {
            Self::Snapshot(h) => Some(h.subscribe()),
            Self::Motion(h) => Some(h.subscribe()),
            Self::Disabled { .. } => None,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            Self::Snapshot(h) => h.shutdown().await,
            Self::Motion(h) => h.shutdown().await,
            Self::Disabled { .. } => {}
        }
    }
}

/// Start the task for the configured strategy.
pub fn spawn_capture(
    config: &CaptureConfig,
) -> Result<(CaptureHandle, Option<JoinHandle<()>>), CaptureError> {
    std::fs::create_dir_all(&config.capture_dir).map_err(|e| CaptureError::Io(e.to_string()))?;
    info!(
        strategy = ?config.strategy,
        dir = %config.capture_dir.display(),
        "starting capture engine"
    );
    match capture_name::trim_excess_captures(&config.capture_dir, config.captures_to_retain) {
        Ok(removed) if !removed.is_empty() => {
            info!(removed = removed.len(), "trimmed old captures at startup");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "capture retention failed at startup"),
    }
    match config.strategy {
        CaptureStrategy::Snapshot => {
            let (handle, join) = spawn_snapshot(config.clone())?;
            Ok((CaptureHandle::Snapshot(handle), Some(join)))
        }
        CaptureStrategy::Motion => {
            let (handle, join) = spawn_motion(config.clone());
            Ok((CaptureHandle::Motion(handle), Some(join)))
        }
        CaptureStrategy::Disabled => Ok((
            CaptureHandle::Disabled {
                last: capture_name::find_last_capture(&config.capture_dir),
                dir: config.capture_dir.clone(),
                retain: config.captures_to_retain,
            },
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn disabled_engine_declines_captures() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("capture-20240301-120000.jpg"), b"x").unwrap();
        let config = CaptureConfig {
            strategy: CaptureStrategy::Disabled,
            capture_dir: dir.path().to_path_buf(),
            ..CaptureConfig::default()
        };

        let (handle, join) = spawn_capture(&config).unwrap();
        assert!(join.is_none());
        assert!(matches!(
            handle.capture_photo().await,
            Err(CaptureError::Disabled)
        ));
        assert!(matches!(
            handle.start_motion().await,
            Err(CaptureError::MotionUnsupported(CaptureStrategy::Disabled))
        ));
        let last = handle.last_capture().await.unwrap().unwrap();
        assert_eq!(last.name, "capture-20240301-120000.jpg");
    }

    #[tokio::test]
    async fn startup_trims_to_retained_count() {
        let dir = tempdir().unwrap();
        for name in [
            "capture-20240301-120000.jpg",
            "capture-20240301-120001.jpg",
            "capture-20240301-120002.jpg",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let config = CaptureConfig {
            strategy: CaptureStrategy::Disabled,
            capture_dir: dir.path().to_path_buf(),
            captures_to_retain: 1,
            ..CaptureConfig::default()
        };

        let (handle, _) = spawn_capture(&config).unwrap();
        assert_eq!(
            capture_name::list_captures(dir.path()).unwrap(),
            vec!["capture-20240301-120002.jpg"]
        );
        let last = handle.last_capture().await.unwrap().unwrap();
        assert_eq!(last.name, "capture-20240301-120002.jpg");
    }

    #[tokio::test]
    async fn waiter_times_out_on_its_own() {
        let (_tx, rx) = oneshot::channel::<CaptureResult>();
        let result = await_capture(rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(CaptureError::Timeout)));
    }
}
