//! Externally triggered captures.
//!
//! A capture daemon owns the camera. Asking it for a snapshot is a plain
//! HTTP GET whose response only acknowledges the request; the capture is
//! complete when the daemon replaces its "latest capture" symlink.

use super::link_watch::spawn_link_watcher;
use super::waiters::WaiterSet;
use super::{await_capture, spawn_trim, trim_captures, CaptureError, CaptureEvent, CaptureResult};
use crate::metrics::{CAPTURES, CAPTURE_FAILURES};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use treat_core::capture_name::{self, parse_capture_name, CaptureRecord};
use treat_core::config::CaptureConfig;
use treat_core::timebase::secs_to_us;

enum Command {
    Capture(oneshot::Sender<CaptureResult>),
    LastCapture(oneshot::Sender<Option<CaptureRecord>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<CaptureEvent>,
    timeout: Duration,
    dir: PathBuf,
    retain: usize,
}

impl SnapshotHandle {
    pub async fn capture_photo(&self) -> CaptureResult {
        debug!("received request to capture a photo");
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Capture(tx))
            .await
            .map_err(|_| CaptureError::Closed)?;
        await_capture(rx, self.timeout).await
    }

    pub async fn last_capture(&self) -> Result<Option<CaptureRecord>, CaptureError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::LastCapture(tx))
            .await
            .map_err(|_| CaptureError::Closed)?;
        rx.await.map_err(|_| CaptureError::Closed)
    }

    pub async fn trim_excess_captures(&self) -> Result<Vec<String>, CaptureError> {
        trim_captures(self.dir.clone(), self.retain).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct SnapshotTask {
    client: reqwest::Client,
    url: String,
    dir: PathBuf,
    retain: usize,
    waiters: WaiterSet,
    /// Generation of the trigger whose capture has not landed yet.
    outstanding: Option<u64>,
    generation: u64,
    last: Option<CaptureRecord>,
    events: broadcast::Sender<CaptureEvent>,
    trigger_results: mpsc::Sender<(u64, Result<(), String>)>,
}

impl SnapshotTask {
    fn on_capture(&mut self, waiter: oneshot::Sender<CaptureResult>) {
        // Everyone behind the outstanding trigger gave up; its completion
        // may never arrive, so ask again.
        if self.waiters.live() == 0 {
            self.outstanding = None;
        }
        self.waiters.push(waiter);
        if self.outstanding.is_none() {
            self.trigger();
        }
    }

    fn trigger(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        debug!(url = %self.url, generation, "sending snapshot request");
        self.outstanding = Some(generation);
        let request = self.client.get(&self.url);
        let results = self.trigger_results.clone();
        tokio::spawn(async move {
            let outcome = request
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map(|_| ())
                .map_err(|e| e.to_string());
            let _ = results.send((generation, outcome)).await;
        });
    }

    fn on_trigger_result(&mut self, generation: u64, outcome: Result<(), String>) {
        // An answer for an earlier trigger says nothing about the current one.
        if self.outstanding != Some(generation) {
            debug!(generation, ok = outcome.is_ok(), "ignoring stale snapshot response");
            return;
        }
        match outcome {
            Ok(()) => debug!("snapshot request acknowledged"),
            Err(reason) => {
                error!(error = %reason, "snapshot request failed");
                CAPTURE_FAILURES.inc();
                self.outstanding = None;
                self.waiters.fail_all(CaptureError::Trigger(reason.clone()));
                let _ = self.events.send(CaptureEvent::Failed { reason });
            }
        }
    }

    fn on_link(&mut self, name: String) {
        self.outstanding = None;
        match parse_capture_name(&name) {
            Ok(record) => {
                info!(capture = %name, "new capture detected");
                CAPTURES.inc();
                self.last = Some(record);
                let waiters = self.waiters.fulfill_all(&name);
                let _ = self.events.send(CaptureEvent::Completed { name, waiters });
                spawn_trim(self.dir.clone(), self.retain);
            }
            Err(e) => {
                warn!(error = %e, "capture link points at an unexpected file");
                CAPTURE_FAILURES.inc();
                let reason = e.to_string();
                self.waiters.fail_all(CaptureError::BadName(e));
                let _ = self.events.send(CaptureEvent::Failed { reason });
            }
        }
    }
}

pub fn spawn_snapshot(
    config: CaptureConfig,
) -> Result<(SnapshotHandle, JoinHandle<()>), CaptureError> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| CaptureError::Trigger(e.to_string()))?;

    let (tx, mut rx) = mpsc::channel(32);
    let (events, _) = broadcast::channel(32);
    let (link_tx, mut link_rx) = mpsc::channel(8);
    let (trigger_tx, mut trigger_rx) = mpsc::channel(8);

    let link = config.capture_dir.join(&config.snapshot.last_capture_link);
    let watch_interval = Duration::from_micros(secs_to_us(config.snapshot.watch_interval_secs));
    let watcher = spawn_link_watcher(link, watch_interval, link_tx);

    let handle = SnapshotHandle {
        tx,
        events: events.clone(),
        timeout: config.request_timeout(),
        dir: config.capture_dir.clone(),
        retain: config.captures_to_retain,
    };

    let mut task = SnapshotTask {
        client,
        url: config.snapshot.snapshot_url(),
        dir: config.capture_dir.clone(),
        retain: config.captures_to_retain,
        waiters: WaiterSet::default(),
        outstanding: None,
        generation: 0,
        last: capture_name::find_last_capture(&config.capture_dir),
        events,
        trigger_results: trigger_tx,
    };

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Capture(waiter)) => task.on_capture(waiter),
                    Some(Command::LastCapture(reply)) => {
                        let _ = reply.send(task.last.clone());
                    }
                    Some(Command::Shutdown(reply)) => {
                        task.waiters.fail_all(CaptureError::Closed);
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                Some(name) = link_rx.recv() => task.on_link(name),
                Some((generation, outcome)) = trigger_rx.recv() => {
                    task.on_trigger_result(generation, outcome)
                }
            }
        }
        watcher.abort();
        info!("snapshot capture task stopped");
    });

    Ok((handle, join))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};
    use treat_core::config::CaptureStrategy;

    /// Stand-in capture daemon: each request writes a capture and replaces
    /// the link, after `delay`.
    fn fake_daemon(dir: &Path, delay: Duration) -> (u16, Arc<AtomicUsize>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let dir = dir.to_path_buf();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let _ = request.respond(Response::from_string("Snapshot completed"));
                std::thread::sleep(delay);
                let name = format!("capture-20240301-1200{:02}.jpg", n % 60);
                replace_link(&dir, &name);
            }
        });
        (port, requests)
    }

    /// Daemon whose first answer is an error that arrives after its capture
    /// has already landed; later requests succeed and land after `delay`.
    fn late_error_daemon(dir: &Path, delay: Duration) -> (u16, Arc<AtomicUsize>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let dir = dir.to_path_buf();
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let name = format!("capture-20240301-1200{:02}.jpg", n % 60);
                if n == 0 {
                    replace_link(&dir, &name);
                    std::thread::sleep(Duration::from_millis(400));
                    let _ = request.respond(Response::from_string("busy").with_status_code(500));
                } else {
                    let _ = request.respond(Response::from_string("Snapshot completed"));
                    std::thread::sleep(delay);
                    replace_link(&dir, &name);
                }
            }
        });
        (port, requests)
    }

    fn replace_link(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"jpg").unwrap();
        let link = dir.join("lastsnap.jpg");
        let _ = std::fs::remove_file(&link);
        symlink(name, &link).unwrap();
    }

    fn config(dir: &Path, port: u16, timeout_secs: f64) -> CaptureConfig {
        let mut config = CaptureConfig {
            strategy: CaptureStrategy::Snapshot,
            capture_dir: dir.to_path_buf(),
            request_timeout_secs: timeout_secs,
            ..CaptureConfig::default()
        };
        config.snapshot.control_host = "127.0.0.1".to_string();
        config.snapshot.control_port = port;
        config.snapshot.watch_interval_secs = 0.01;
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_requests_share_one_trigger() {
        let dir = tempdir().unwrap();
        let (port, requests) = fake_daemon(dir.path(), Duration::from_millis(100));
        let (handle, _join) = spawn_snapshot(config(dir.path(), port, 3.0)).unwrap();

        let (a, b) = tokio::join!(handle.capture_photo(), handle.capture_photo());
        assert_eq!(a.unwrap(), "capture-20240301-120000.jpg");
        assert_eq!(b.unwrap(), "capture-20240301-120000.jpg");
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let last = handle.last_capture().await.unwrap().unwrap();
        assert_eq!(last.name, "capture-20240301-120000.jpg");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_failure_fails_waiters() {
        let dir = tempdir().unwrap();
        // Bind then drop to find a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (handle, _join) = spawn_snapshot(config(dir.path(), port, 3.0)).unwrap();

        let mut events = handle.subscribe();
        assert!(matches!(
            handle.capture_photo().await,
            Err(CaptureError::Trigger(_))
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CaptureEvent::Failed { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_trigger_is_reissued() {
        let dir = tempdir().unwrap();
        let (port, requests) = fake_daemon(dir.path(), Duration::from_millis(400));
        let (handle, _join) = spawn_snapshot(config(dir.path(), port, 0.1)).unwrap();

        assert!(matches!(
            handle.capture_photo().await,
            Err(CaptureError::Timeout)
        ));
        // Nobody is waiting on the first trigger any more, so a later
        // request asks the daemon again.
        let _ = handle.capture_photo().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while requests.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_error_for_earlier_trigger_is_ignored() {
        let dir = tempdir().unwrap();
        let (port, requests) = late_error_daemon(dir.path(), Duration::from_millis(600));
        let (handle, _join) = spawn_snapshot(config(dir.path(), port, 3.0)).unwrap();

        let first = handle.capture_photo().await;
        assert_eq!(first.unwrap(), "capture-20240301-120000.jpg");

        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.capture_photo().await }
        });
        // The first trigger's error lands while the second is still in
        // flight; a request made now shares the second trigger.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let third = handle.capture_photo().await;

        assert_eq!(second.await.unwrap().unwrap(), "capture-20240301-120001.jpg");
        assert_eq!(third.unwrap(), "capture-20240301-120001.jpg");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }
}
