//! Completion source for externally triggered captures: the capture daemon
//! (re)creates a "latest capture" symlink after writing each image.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkState {
    target: PathBuf,
    modified: Option<SystemTime>,
}

async fn link_state(link: &Path) -> Option<LinkState> {
    let meta = tokio::fs::symlink_metadata(link).await.ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    let target = tokio::fs::read_link(link).await.ok()?;
    Some(LinkState {
        target,
        modified: meta.modified().ok(),
    })
}

/// Poll `link` and send the file name of its target each time the link is
/// replaced. The state present at startup is not reported.
pub fn spawn_link_watcher(
    link: PathBuf,
    interval: Duration,
    events: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen = link_state(&link).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let current = link_state(&link).await;
            if current != seen {
                if let Some(state) = &current {
                    let name = state
                        .target
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    debug!(link = %link.display(), target = %name, "capture link replaced");
                    if events.send(name).await.is_err() {
                        return;
                    }
                }
                seen = current;
            }
        }
    })
}
