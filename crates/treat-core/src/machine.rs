//! Dispenser behaviour as a pure transition function.
//!
//! ```text
//!  IDLE ──[button]──▶ LIGHT_LCD ──[held / request]──▶ DISPENSING
//!    │                    │                              │
//!    │              [idle timeout]                 [exit deadline]
//!    │                    ▼                              ▼
//!    │◀───────────────── IDLE          IDLE ◀──[recovered]── RECOVERING
//!    └──[request]──▶ DISPENSING
//! ```
//!
//! [`advance`] takes the current state and one event and returns the next
//! state plus the [`Effect`]s the driver must apply. Entering a state runs
//! its enter hook; there is no exit hook.

use crate::config::DispenserConfig;
use crate::timebase::secs_to_us;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StateKind {
    Idle,
    LightLcd,
    Dispensing,
    Recovering,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::LightLcd => "LightLcd",
            Self::Dispensing => "Dispensing",
            Self::Recovering => "Recovering",
        }
    }

    /// Gauge encoding used by the metrics exporter.
    pub fn code(&self) -> u8 {
        match self {
            Self::Idle => 1,
            Self::LightLcd => 2,
            Self::Dispensing => 3,
            Self::Recovering => 4,
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters scoped to one dispense cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleCounters {
    pub entered_us: u64,
    pub cycle_treat_count: u32,
    pub dispense_deadline_us: u64,
    pub exit_deadline_us: u64,
    pub power_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    LightLcd {
        button_down: bool,
        last_activity_us: u64,
    },
    Dispensing(CycleCounters),
    Recovering {
        entered_us: u64,
    },
}

impl MachineState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::LightLcd { .. } => StateKind::LightLcd,
            Self::Dispensing(_) => StateKind::Dispensing,
            Self::Recovering { .. } => StateKind::Recovering,
        }
    }

    /// Dispensing polls faster to catch detector edges.
    pub fn poll_interval(&self, config: &DispenserConfig) -> Duration {
        match self {
            Self::Dispensing(_) => config.treat_poll_interval(),
            _ => config.button_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    TreatDetected,
    ButtonPressed,
    ButtonReleased,
    DispenseRequested,
    TimerTick,
}

/// Readings sampled by the driver for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepInput {
    pub now_us: u64,
    pub button_pressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    DispenserPower(bool),
    Backlight(bool),
    ShowMessage(&'static str),
    RefreshStats { force: bool },
    RecordDispense(u32),
}

pub const DISPENSING_MESSAGE: &str = "Dispensing...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub state: MachineState,
    pub effects: Vec<Effect>,
    /// Set when the event caused a state change.
    pub entered: Option<StateKind>,
}

/// Build a freshly entered state and the effects of its enter hook.
pub fn enter(
    kind: StateKind,
    config: &DispenserConfig,
    input: StepInput,
) -> (MachineState, Vec<Effect>) {
    let now = input.now_us;
    match kind {
        StateKind::Idle => (
            MachineState::Idle,
            vec![Effect::Backlight(false), Effect::RefreshStats { force: true }],
        ),
        StateKind::LightLcd => (
            MachineState::LightLcd {
                button_down: input.button_pressed,
                last_activity_us: now,
            },
            vec![Effect::RefreshStats { force: true }, Effect::Backlight(true)],
        ),
        StateKind::Dispensing => {
            let dispense_deadline_us = now + secs_to_us(config.treat_enabled_secs);
            let counters = CycleCounters {
                entered_us: now,
                cycle_treat_count: 0,
                dispense_deadline_us,
                exit_deadline_us: dispense_deadline_us + secs_to_us(config.post_cycle_secs),
                power_on: true,
            };
            (
                MachineState::Dispensing(counters),
                vec![
                    Effect::DispenserPower(true),
                    Effect::ShowMessage(DISPENSING_MESSAGE),
                    Effect::Backlight(true),
                ],
            )
        }
        StateKind::Recovering => (
            MachineState::Recovering { entered_us: now },
            vec![
                Effect::DispenserPower(false),
                Effect::RefreshStats { force: true },
                Effect::Backlight(true),
            ],
        ),
    }
}

/// Deliver one event to `state`.
pub fn advance(
    state: MachineState,
    event: MachineEvent,
    config: &DispenserConfig,
    input: StepInput,
) -> Step {
    let mut state = state;
    let mut effects = Vec::new();
    let next = handle(&mut state, event, config, input, &mut effects);

    match next {
        Some(kind) => {
            let (entered_state, enter_effects) = enter(kind, config, input);
            effects.extend(enter_effects);
            Step {
                state: entered_state,
                effects,
                entered: Some(kind),
            }
        }
        None => Step {
            state,
            effects,
            entered: None,
        },
    }
}

fn handle(
    state: &mut MachineState,
    event: MachineEvent,
    config: &DispenserConfig,
    input: StepInput,
    effects: &mut Vec<Effect>,
) -> Option<StateKind> {
    let now = input.now_us;
    match (state, event) {
        (MachineState::Idle, MachineEvent::ButtonPressed) => Some(StateKind::LightLcd),
        (MachineState::Idle, MachineEvent::DispenseRequested) => Some(StateKind::Dispensing),
        (MachineState::Idle, MachineEvent::TimerTick) => {
            effects.push(Effect::RefreshStats { force: false });
            None
        }

        (
            MachineState::LightLcd {
                button_down,
                last_activity_us,
            },
            MachineEvent::ButtonPressed | MachineEvent::ButtonReleased,
        ) => {
            *button_down = event == MachineEvent::ButtonPressed;
            *last_activity_us = now;
            None
        }
        (MachineState::LightLcd { .. }, MachineEvent::DispenseRequested) => {
            Some(StateKind::Dispensing)
        }
        (
            MachineState::LightLcd {
                button_down,
                last_activity_us,
            },
            MachineEvent::TimerTick,
        ) => {
            effects.push(Effect::RefreshStats { force: false });
            let quiet_us = now.saturating_sub(*last_activity_us);
            if *button_down {
                (quiet_us >= secs_to_us(config.button_hold_for_treat_secs))
                    .then_some(StateKind::Dispensing)
            } else {
                (quiet_us >= secs_to_us(config.return_to_idle_secs)).then_some(StateKind::Idle)
            }
        }

        (MachineState::Dispensing(counters), MachineEvent::TreatDetected) => {
            counters.cycle_treat_count += 1;
            let limit = config.max_treats_per_cycle;
            if limit > 0 && counters.cycle_treat_count >= limit {
                if counters.power_on {
                    counters.power_on = false;
                    effects.push(Effect::DispenserPower(false));
                }
                let early_exit = now + secs_to_us(config.post_cycle_secs);
                counters.exit_deadline_us = counters.exit_deadline_us.min(early_exit);
            }
            None
        }
        (MachineState::Dispensing(counters), MachineEvent::TimerTick) => {
            if counters.power_on && now >= counters.dispense_deadline_us {
                counters.power_on = false;
                effects.push(Effect::DispenserPower(false));
            }
            if now >= counters.exit_deadline_us {
                effects.push(Effect::RecordDispense(counters.cycle_treat_count));
                return Some(StateKind::Recovering);
            }
            None
        }

        (MachineState::Recovering { entered_us }, MachineEvent::TimerTick) => {
            effects.push(Effect::RefreshStats { force: false });
            (now.saturating_sub(*entered_us) >= secs_to_us(config.treat_recovery_secs))
                .then_some(StateKind::Idle)
        }

        _ => None,
    }
}
