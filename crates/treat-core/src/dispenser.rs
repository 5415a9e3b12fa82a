use crate::config::DispenserConfig;
use crate::hal::{
    DisplayMode, DisplayPort, HalError, HardwarePort, HistoryPort, PinDirection, TreatStats,
};
use crate::machine::{self, Effect, MachineEvent, MachineState, StateKind, StepInput};
use crate::status::{format_lcd_stats, NOT_RUNNING};
use crate::timebase::{secs_to_us, Clock};
use log::{debug, info, warn};
use std::time::Duration;

pub const DISABLED_MESSAGE: &str = "Treater disabled";

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct DispenserStats {
    pub ticks: u64,
    pub tick_errors: u64,
    pub cycles_completed: u64,
    pub treats_detected: u64,
    pub dispenses_rejected: u64,
    /// Treats counted by the most recently recorded cycle.
    pub last_cycle_treats: u32,
}

/// Owns the ports and the current [`MachineState`], samples the pins once
/// per tick and applies the effects returned by [`machine::advance`].
pub struct Dispenser<IO, D, H, C>
where
    IO: HardwarePort,
    D: DisplayPort,
    H: HistoryPort,
    C: Clock,
{
    io: IO,
    display: D,
    history: H,
    clock: C,
    config: DispenserConfig,
    state: Option<MachineState>,
    last_detector: bool,
    last_button: bool,
    last_stats_refresh_us: Option<u64>,
    stats: DispenserStats,
}

impl<IO, D, H, C> Dispenser<IO, D, H, C>
where
    IO: HardwarePort,
    D: DisplayPort,
    H: HistoryPort,
    C: Clock,
{
    /// Claim the pins and blank the display. Fails if any pin cannot be set
    /// up; the machine is not started.
    pub fn new(
        mut io: IO,
        mut display: D,
        history: H,
        clock: C,
        config: DispenserConfig,
    ) -> Result<Self, HalError> {
        display.clear()?;
        display.write_lines("", "")?;
        display.clear()?;
        display.set_backlight(false)?;
        display.set_display_mode(DisplayMode::TEXT_ONLY)?;

        let pins = config.pins;
        io.setup(pins.treat_detector, PinDirection::In, None)?;
        io.setup(pins.button, PinDirection::In, None)?;
        io.setup(pins.treat_power, PinDirection::Out, Some(false))?;

        Ok(Self {
            io,
            display,
            history,
            clock,
            config,
            state: None,
            last_detector: false,
            last_button: false,
            last_stats_refresh_us: None,
            stats: DispenserStats::default(),
        })
    }

    pub fn start(&mut self) {
        if self.state.is_some() {
            return;
        }
        info!("Dispenser starting");
        self.last_detector = false;
        self.last_button = false;
        self.change_state(StateKind::Idle);
    }

    pub fn stop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        info!("Dispenser stopping from {}", state.kind());
        let effects = [
            Effect::DispenserPower(false),
            Effect::ShowMessage(DISABLED_MESSAGE),
            Effect::Backlight(false),
        ];
        self.apply(effects);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&MachineState> {
        self.state.as_ref()
    }

    pub fn state_kind(&self) -> Option<StateKind> {
        self.state.map(|s| s.kind())
    }

    pub fn state_name(&self) -> &'static str {
        self.state_kind().map_or(NOT_RUNNING, |k| k.as_str())
    }

    /// Ask for a dispense cycle. Returns whether one is now active.
    pub fn request_dispense(&mut self) -> bool {
        self.deliver(MachineEvent::DispenseRequested);
        let active = self.state_kind() == Some(StateKind::Dispensing);
        if !active {
            self.stats.dispenses_rejected += 1;
            debug!("Dispense request declined in state {}", self.state_name());
        }
        active
    }

    /// Run one poll cycle and return the delay before the next one.
    pub fn tick(&mut self) -> Duration {
        self.stats.ticks += 1;
        if let Err(e) = self.poll() {
            self.stats.tick_errors += 1;
            warn!("Dispenser tick failed: {}", e);
        }
        self.poll_interval()
    }

    pub fn poll_interval(&self) -> Duration {
        match &self.state {
            Some(state) => state.poll_interval(&self.config),
            None => self.config.button_poll_interval(),
        }
    }

    pub fn stats(&self) -> &DispenserStats {
        &self.stats
    }

    pub fn config(&self) -> &DispenserConfig {
        &self.config
    }

    pub fn treat_stats(&mut self) -> TreatStats {
        let now = self.clock.wall();
        self.history.stats(now)
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Give the pins back to the system. The dispenser is stopped first.
    pub fn release(&mut self) {
        self.stop();
        let pins = self.config.pins;
        for pin in [pins.treat_detector, pins.button, pins.treat_power] {
            if let Err(e) = self.io.release(pin) {
                warn!("Failed to release {}: {}", pin, e);
            }
        }
    }

    fn poll(&mut self) -> Result<(), HalError> {
        if self.state.is_none() {
            return Ok(());
        }
        let pins = self.config.pins;

        let detector = self.io.read(pins.treat_detector)?;
        if detector != self.last_detector {
            self.last_detector = detector;
            if detector {
                self.stats.treats_detected += 1;
                self.deliver(MachineEvent::TreatDetected);
            }
        }

        let level = self.io.read(pins.button)?;
        let pressed = level != self.config.button_active_low;
        if pressed != self.last_button {
            self.last_button = pressed;
            if pressed {
                debug!("Button pressed");
                self.deliver(MachineEvent::ButtonPressed);
            } else {
                debug!("Button released");
                self.deliver(MachineEvent::ButtonReleased);
            }
        }

        self.deliver(MachineEvent::TimerTick);
        Ok(())
    }

    fn input(&self) -> StepInput {
        StepInput {
            now_us: self.clock.now_us(),
            button_pressed: self.last_button,
        }
    }

    fn deliver(&mut self, event: MachineEvent) {
        let Some(state) = self.state else {
            return;
        };
        let step = machine::advance(state, event, &self.config, self.input());
        if let Some(next) = step.entered {
            debug!("Changing states, {} -> {}", state.kind(), next);
            if next == StateKind::Recovering {
                self.stats.cycles_completed += 1;
            }
        }
        self.state = Some(step.state);
        self.apply(step.effects);
    }

    fn change_state(&mut self, kind: StateKind) {
        let (state, effects) = machine::enter(kind, &self.config, self.input());
        debug!("Entering {}", kind);
        self.state = Some(state);
        self.apply(effects);
    }

    fn apply(&mut self, effects: impl IntoIterator<Item = Effect>) {
        for effect in effects {
            if let Err(e) = self.apply_one(&effect) {
                warn!("Failed to apply {:?}: {}", effect, e);
            }
        }
    }

    fn apply_one(&mut self, effect: &Effect) -> Result<(), HalError> {
        match *effect {
            Effect::DispenserPower(on) => self.io.write(self.config.pins.treat_power, on),
            Effect::Backlight(on) => self.display.set_backlight(on),
            Effect::ShowMessage(message) => self.display.write_lines(message, ""),
            Effect::RefreshStats { force } => self.refresh_stats(force),
            Effect::RecordDispense(count) => {
                let now = self.clock.wall();
                self.history.record_dispense(count, now);
                self.stats.last_cycle_treats = count;
                Ok(())
            }
        }
    }

    fn refresh_stats(&mut self, force: bool) -> Result<(), HalError> {
        let now_us = self.clock.now_us();
        let throttle_us = secs_to_us(self.config.stats_refresh_secs);
        if let Some(last) = self.last_stats_refresh_us {
            if !force && now_us.saturating_sub(last) < throttle_us {
                return Ok(());
            }
        }
        self.last_stats_refresh_us = Some(now_us);

        let now = self.clock.wall();
        let stats = self.history.stats(now);
        let (line1, line2) = format_lcd_stats(&stats, now);
        self.display.write_lines(&line1, &line2)
    }
}
