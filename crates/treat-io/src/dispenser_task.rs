//! Single-owner task around [`Dispenser`].
//!
//! The task ticks the machine at the interval chosen by its current state
//! and serves commands between ticks, so nothing else ever touches the
//! dispenser or its ports.

use crate::metrics::{
    DISPENSE_CYCLES, DISPENSE_REJECTED, MACHINE_STATE, TICKS, TICK_ERRORS, TREATS_DETECTED,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use treat_core::hal::{DisplayPort, HardwarePort, HistoryPort, TreatStats};
use treat_core::machine::StateKind;
use treat_core::timebase::Clock;
use treat_core::{Dispenser, DispenserStats};

#[derive(Debug, Error)]
#[error("dispenser task is no longer running")]
pub struct DispenserGone;

#[derive(Debug, Clone)]
pub struct DispenserStatus {
    pub state: Option<StateKind>,
    pub treats: TreatStats,
    pub stats: DispenserStats,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispenserEvent {
    StateChanged {
        from: Option<StateKind>,
        to: Option<StateKind>,
    },
    DispenseAccepted,
    DispenseRejected {
        state: Option<StateKind>,
    },
    CycleCompleted {
        treats: u32,
    },
}

enum Command {
    Dispense(oneshot::Sender<bool>),
    Status(oneshot::Sender<DispenserStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct DispenserHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<DispenserEvent>,
}

impl DispenserHandle {
    /// Returns whether a dispense cycle is now running. A busy machine
    /// declines the request; it is not queued.
    pub async fn dispense_treat(&self) -> Result<bool, DispenserGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Dispense(tx))
            .await
            .map_err(|_| DispenserGone)?;
        rx.await.map_err(|_| DispenserGone)
    }

    pub async fn status(&self) -> Result<DispenserStatus, DispenserGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(tx))
            .await
            .map_err(|_| DispenserGone)?;
        rx.await.map_err(|_| DispenserGone)
    }

    /// Stop the machine, release its pins and end the task.
    pub async fn shutdown(&self) -> Result<(), DispenserGone> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| DispenserGone)?;
        rx.await.map_err(|_| DispenserGone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispenserEvent> {
        self.events.subscribe()
    }
}

struct DispenserTask<IO, D, H, C>
where
    IO: HardwarePort,
    D: DisplayPort,
    H: HistoryPort,
    C: Clock,
{
    dispenser: Dispenser<IO, D, H, C>,
    events: broadcast::Sender<DispenserEvent>,
    published: DispenserStats,
    last_state: Option<StateKind>,
}

impl<IO, D, H, C> DispenserTask<IO, D, H, C>
where
    IO: HardwarePort,
    D: DisplayPort,
    H: HistoryPort,
    C: Clock,
{
    fn emit(&self, event: DispenserEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Push counter deltas and state changes out to metrics and listeners.
    fn publish(&mut self) {
        let stats = self.dispenser.stats().clone();
        TICKS.inc_by(stats.ticks - self.published.ticks);
        TICK_ERRORS.inc_by(stats.tick_errors - self.published.tick_errors);
        TREATS_DETECTED.inc_by(stats.treats_detected - self.published.treats_detected);
        DISPENSE_REJECTED.inc_by(stats.dispenses_rejected - self.published.dispenses_rejected);
        let cycles = stats.cycles_completed - self.published.cycles_completed;
        DISPENSE_CYCLES.inc_by(cycles);
        if cycles > 0 {
            self.emit(DispenserEvent::CycleCompleted {
                treats: stats.last_cycle_treats,
            });
        }
        self.published = stats;

        let state = self.dispenser.state_kind();
        MACHINE_STATE.set(state.map_or(0, |s| i64::from(s.code())));
        if state != self.last_state {
            debug!(from = ?self.last_state, to = ?state, "machine state changed");
            self.emit(DispenserEvent::StateChanged {
                from: self.last_state,
                to: state,
            });
            self.last_state = state;
        }
    }

    fn status(&mut self) -> DispenserStatus {
        DispenserStatus {
            state: self.dispenser.state_kind(),
            treats: self.dispenser.treat_stats(),
            stats: self.dispenser.stats().clone(),
            now: self.dispenser.clock().wall(),
        }
    }

    /// Returns `false` once the task should end.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Dispense(reply) => {
                let accepted = self.dispenser.request_dispense();
                if accepted {
                    info!("dispense request accepted");
                    self.emit(DispenserEvent::DispenseAccepted);
                } else {
                    info!(state = self.dispenser.state_name(), "dispense request declined");
                    self.emit(DispenserEvent::DispenseRejected {
                        state: self.dispenser.state_kind(),
                    });
                }
                self.publish();
                let _ = reply.send(accepted);
                true
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
                true
            }
            Command::Shutdown(reply) => {
                self.dispenser.release();
                self.publish();
                let _ = reply.send(());
                false
            }
        }
    }
}

/// Start `dispenser` and hand it to a background task.
pub fn spawn_dispenser<IO, D, H, C>(
    mut dispenser: Dispenser<IO, D, H, C>,
) -> (DispenserHandle, JoinHandle<()>)
where
    IO: HardwarePort + 'static,
    D: DisplayPort + 'static,
    H: HistoryPort + 'static,
    C: Clock + 'static,
{
    let (tx, mut rx) = mpsc::channel(16);
    let (events, _) = broadcast::channel(64);
    let handle = DispenserHandle {
        tx,
        events: events.clone(),
    };

    dispenser.start();
    let mut task = DispenserTask {
        last_state: None,
        published: dispenser.stats().clone(),
        dispenser,
        events,
    };
    task.publish();

    let join = tokio::spawn(async move {
        loop {
            let interval = task.dispenser.tick();
            task.publish();
            let next_tick = Instant::now() + interval;

            loop {
                tokio::select! {
                    _ = sleep_until(next_tick) => break,
                    command = rx.recv() => match command {
                        Some(command) => {
                            if !task.handle(command) {
                                info!("dispenser task stopped");
                                return;
                            }
                        }
                        None => {
                            task.dispenser.release();
                            info!("dispenser handles dropped; task stopped");
                            return;
                        }
                    },
                }
            }
        }
    });

    (handle, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use treat_core::config::DispenserConfig;
    use treat_core::{ManualClock, SimulatedDisplay, SimulatedHardware, TreatHistory};

    fn spawn() -> (DispenserHandle, JoinHandle<()>, SimulatedHardware) {
        let config = DispenserConfig::default();
        let hw = SimulatedHardware::new();
        hw.set_input(config.pins.button, true);
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let dispenser = Dispenser::new(
            hw.clone(),
            SimulatedDisplay::new(),
            TreatHistory::in_memory(),
            clock,
            config,
        )
        .unwrap();
        let (handle, join) = spawn_dispenser(dispenser);
        (handle, join, hw)
    }

    #[tokio::test]
    async fn second_dispense_is_rejected_while_busy() {
        let (handle, _join, hw) = spawn();
        let mut events = handle.subscribe();

        assert!(handle.dispense_treat().await.unwrap());
        assert_eq!(hw.level(DispenserConfig::default().pins.treat_power), Some(true));
        assert!(!handle.dispense_treat().await.unwrap());

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, Some(StateKind::Dispensing));
        assert_eq!(status.stats.dispenses_rejected, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&DispenserEvent::DispenseAccepted));
        assert!(seen.contains(&DispenserEvent::DispenseRejected {
            state: Some(StateKind::Dispensing)
        }));
    }

    #[tokio::test]
    async fn shutdown_releases_pins_and_ends_task() {
        let (handle, join, hw) = spawn();
        assert_eq!(handle.status().await.unwrap().state, Some(StateKind::Idle));

        handle.shutdown().await.unwrap();
        join.await.unwrap();

        let pins = DispenserConfig::default().pins;
        assert!(!hw.is_configured(pins.treat_power));
        assert!(matches!(handle.status().await, Err(DispenserGone)));
    }
}
