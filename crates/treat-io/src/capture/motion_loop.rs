//! Self-driven captures: a low-resolution motion loop plus full captures,
//! both produced by running the camera program as a child process.

use super::waiters::WaiterSet;
use super::{await_capture, spawn_trim, trim_captures, CaptureError, CaptureEvent, CaptureResult};
use crate::metrics::{CAPTURES, CAPTURE_FAILURES, MOTION_DETECTIONS, MOTION_RUNNING};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as ProcessCommand;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use treat_core::capture_name::{self, unique_capture_name, CaptureRecord};
use treat_core::config::{CaptureConfig, MotionConfig};
use treat_core::{CaptureCycle, CaptureCycleState, CycleAction, MotionDetector, TimeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionStatus {
    pub running: bool,
    pub state: CaptureCycleState,
}

enum Command {
    Capture(oneshot::Sender<CaptureResult>),
    LastCapture(oneshot::Sender<Option<CaptureRecord>>),
    StartMotion(oneshot::Sender<MotionStatus>),
    StopMotion(oneshot::Sender<MotionStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Completions reported back to the task by the processes and timers it
/// spawned.
enum Completion {
    TimerFired(u64),
    MotionFrame(Result<Vec<u8>, String>),
    FullCapture {
        name: String,
        outcome: Result<(), String>,
    },
}

#[derive(Clone)]
pub struct MotionHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<CaptureEvent>,
    timeout: Duration,
    dir: PathBuf,
    retain: usize,
}

impl MotionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CaptureError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| CaptureError::Closed)?;
        rx.await.map_err(|_| CaptureError::Closed)
    }

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
        self.request(Command::LastCapture).await
    }

    pub async fn trim_excess_captures(&self) -> Result<Vec<String>, CaptureError> {
        trim_captures(self.dir.clone(), self.retain).await
    }

    pub async fn start_motion(&self) -> Result<MotionStatus, CaptureError> {
        self.request(Command::StartMotion).await
    }

    pub async fn stop_motion(&self) -> Result<MotionStatus, CaptureError> {
        self.request(Command::StopMotion).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

async fn run_program(program: &str, args: &[String]) -> Result<Vec<u8>, String> {
    let output = ProcessCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("{program}: {e}"))?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{program} exited with {}: {}", output.status, stderr.trim()))
    }
}

struct MotionTask {
    cycle: CaptureCycle,
    detector: MotionDetector,
    motion: MotionConfig,
    dir: PathBuf,
    retain: usize,
    waiters: WaiterSet,
    last: Option<CaptureRecord>,
    events: broadcast::Sender<CaptureEvent>,
    completions: mpsc::Sender<Completion>,
    timebase: TimeBase,
}

impl MotionTask {
    fn status(&self) -> MotionStatus {
        MotionStatus {
            running: self.cycle.is_running(),
            state: self.cycle.state(),
        }
    }

    fn apply(&mut self, actions: Vec<CycleAction>) {
        for action in actions {
            match action {
                CycleAction::SpawnMotionCapture => self.spawn_motion_capture(),
                CycleAction::SpawnFullCapture => self.spawn_full_capture(),
                CycleAction::ScheduleMotionCapture { after, generation } => {
                    let completions = self.completions.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = completions.send(Completion::TimerFired(generation)).await;
                    });
                }
                CycleAction::AutoDisabled => {
                    info!("motion capture disabled after its window elapsed");
                }
            }
        }
        MOTION_RUNNING.set(i64::from(self.cycle.is_running()));
    }

    fn spawn_motion_capture(&self) {
        let program = self.motion.motion_capture_program.clone();
        let args = self.motion.motion_capture_args.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let frame = run_program(&program, &args).await;
            let _ = completions.send(Completion::MotionFrame(frame)).await;
        });
    }

    fn spawn_full_capture(&self) {
        let name = unique_capture_name(&self.dir, Local::now());
        let path = self.dir.join(&name);
        let program = self.motion.capture_program.clone();
        let mut args = self.motion.capture_args.clone();
        args.push(path.to_string_lossy().into_owned());
        debug!(capture = %name, "starting full capture");

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = run_program(&program, &args).await.map(|_| ());
            let _ = completions
                .send(Completion::FullCapture { name, outcome })
                .await;
        });
    }

    fn on_capture(&mut self, waiter: oneshot::Sender<CaptureResult>) {
        self.waiters.push(waiter);
        let actions = self.cycle.force_capture();
        self.apply(actions);
    }

    fn on_motion_frame(&mut self, frame: Result<Vec<u8>, String>) {
        let motion = match frame {
            Ok(bytes) => match self.detector.observe_bytes(&bytes) {
                Ok(reading) => {
                    if reading.motion {
                        MOTION_DETECTIONS.inc();
                    }
                    reading.motion
                }
                Err(e) => {
                    warn!(error = %e, "motion frame could not be decoded");
                    false
                }
            },
            Err(reason) => {
                warn!(error = %reason, "motion capture failed");
                false
            }
        };
        let actions = self.cycle.motion_completed(motion, self.timebase.now_us());
        self.apply(actions);
    }

    fn on_full_capture(&mut self, name: String, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                info!(capture = %name, "capture complete");
                CAPTURES.inc();
                match capture_name::parse_capture_name(&name) {
                    Ok(record) => self.last = Some(record),
                    Err(e) => warn!(error = %e, "capture written under an unparseable name"),
                }
                let waiters = self.waiters.fulfill_all(&name);
                let _ = self.events.send(CaptureEvent::Completed { name, waiters });
                spawn_trim(self.dir.clone(), self.retain);
            }
            Err(reason) => {
                error!(capture = %name, error = %reason, "full capture failed");
                CAPTURE_FAILURES.inc();
                self.waiters.fail_all(CaptureError::Process(reason.clone()));
                let _ = self.events.send(CaptureEvent::Failed { reason });
            }
        }
        let actions = self.cycle.full_completed();
        self.apply(actions);
    }
}

pub fn spawn_motion(config: CaptureConfig) -> (MotionHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(32);
    let (events, _) = broadcast::channel(32);
    let (completions, mut completion_rx) = mpsc::channel(16);

    let handle = MotionHandle {
        tx,
        events: events.clone(),
        timeout: config.request_timeout(),
        dir: config.capture_dir.clone(),
        retain: config.captures_to_retain,
    };

    let motion = config.motion;
    let mut task = MotionTask {
        cycle: CaptureCycle::new(motion.motion_interval(), motion.motion_auto_disable_secs),
        detector: MotionDetector::new(motion.motion_threshold, motion.motion_sensitivity),
        last: capture_name::find_last_capture(&config.capture_dir),
        dir: config.capture_dir,
        retain: config.captures_to_retain,
        motion,
        waiters: WaiterSet::default(),
        events,
        completions,
        timebase: TimeBase::new(),
    };
    MOTION_RUNNING.set(0);

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Capture(waiter)) => task.on_capture(waiter),
                    Some(Command::LastCapture(reply)) => {
                        let _ = reply.send(task.last.clone());
                    }
                    Some(Command::StartMotion(reply)) => {
                        let actions = task.cycle.start_motion(task.timebase.now_us());
                        task.apply(actions);
                        let _ = reply.send(task.status());
                    }
                    Some(Command::StopMotion(reply)) => {
                        task.cycle.stop_motion();
                        MOTION_RUNNING.set(0);
                        let _ = reply.send(task.status());
                    }
                    Some(Command::Shutdown(reply)) => {
                        task.cycle.stop_motion();
                        task.waiters.fail_all(CaptureError::Closed);
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                Some(completion) = completion_rx.recv() => match completion {
                    Completion::TimerFired(generation) => {
                        let actions = task.cycle.motion_timer_fired(generation);
                        task.apply(actions);
                    }
                    Completion::MotionFrame(frame) => task.on_motion_frame(frame),
                    Completion::FullCapture { name, outcome } => task.on_full_capture(name, outcome),
                },
            }
        }
        MOTION_RUNNING.set(0);
        info!("motion capture task stopped");
    });

    (handle, join)
}
