//! In-memory ports used by tests and by `--simulate`.
//!
//! Both types are cheap handles over shared state, so a test (or the feeder
//! task) can keep a clone and observe or drive the pins after the dispenser
//! has taken ownership of its own copy.

use crate::hal::{DisplayMode, DisplayPort, HalError, HardwarePort, PinDirection, PinId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct PinBank {
    directions: HashMap<PinId, PinDirection>,
    levels: HashMap<PinId, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedHardware {
    bank: Arc<Mutex<PinBank>>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&self) -> MutexGuard<'_, PinBank> {
        self.bank.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drive an input line. Levels set before `setup` are kept.
    pub fn set_input(&self, pin: PinId, level: bool) {
        self.bank().levels.insert(pin, level);
    }

    pub fn level(&self, pin: PinId) -> Option<bool> {
        self.bank().levels.get(&pin).copied()
    }

    pub fn is_configured(&self, pin: PinId) -> bool {
        self.bank().directions.contains_key(&pin)
    }
}

impl HardwarePort for SimulatedHardware {
    fn setup(
        &mut self,
        pin: PinId,
        direction: PinDirection,
        initial: Option<bool>,
    ) -> Result<(), HalError> {
        let mut bank = self.bank();
        bank.directions.insert(pin, direction);
        match initial {
            Some(level) => {
                bank.levels.insert(pin, level);
            }
            None => {
                bank.levels.entry(pin).or_insert(false);
            }
        }
        Ok(())
    }

    fn read(&mut self, pin: PinId) -> Result<bool, HalError> {
        let bank = self.bank();
        if !bank.directions.contains_key(&pin) {
            return Err(HalError::NotConfigured(pin));
        }
        Ok(bank.levels.get(&pin).copied().unwrap_or(false))
    }

    fn write(&mut self, pin: PinId, value: bool) -> Result<(), HalError> {
        let mut bank = self.bank();
        match bank.directions.get(&pin) {
            None => Err(HalError::NotConfigured(pin)),
            Some(PinDirection::In) => Err(HalError::NotOutput(pin)),
            Some(PinDirection::Out) => {
                bank.levels.insert(pin, value);
                Ok(())
            }
        }
    }

    fn release(&mut self, pin: PinId) -> Result<(), HalError> {
        self.bank().directions.remove(&pin);
        Ok(())
    }
}

/// Treat mechanism model: while the power line is high the detector
/// produces a square wave, one rising edge per `period`.
#[derive(Debug, Clone)]
pub struct SimulatedFeeder {
    hardware: SimulatedHardware,
    power: PinId,
    detector: PinId,
    period: Duration,
    powered_for: Duration,
}

impl SimulatedFeeder {
    pub fn new(hardware: SimulatedHardware, power: PinId, detector: PinId, period: Duration) -> Self {
        Self {
            hardware,
            power,
            detector,
            period: period.max(Duration::from_millis(1)),
            powered_for: Duration::ZERO,
        }
    }

    pub fn step(&mut self, dt: Duration) {
        let powered = self.hardware.level(self.power).unwrap_or(false);
        if !powered {
            self.powered_for = Duration::ZERO;
            self.hardware.set_input(self.detector, false);
            return;
        }
        self.powered_for += dt;
        let phase = self.powered_for.as_micros() % self.period.as_micros();
        // Low for the first half so a treat takes a full period to drop.
        let high = phase * 2 >= self.period.as_micros();
        self.hardware.set_input(self.detector, high);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub line1: String,
    pub line2: String,
    pub backlight: bool,
    pub mode: DisplayMode,
    pub writes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedDisplay {
    state: Arc<Mutex<DisplaySnapshot>>,
}

impl SimulatedDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DisplaySnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        self.state().clone()
    }
}

impl DisplayPort for SimulatedDisplay {
    fn write_lines(&mut self, line1: &str, line2: &str) -> Result<(), HalError> {
        let mut state = self.state();
        state.line1 = line1.to_string();
        state.line2 = line2.to_string();
        state.writes += 1;
        Ok(())
    }

    fn set_backlight(&mut self, on: bool) -> Result<(), HalError> {
        self.state().backlight = on;
        Ok(())
    }

    fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), HalError> {
        self.state().mode = mode;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), HalError> {
        let mut state = self.state();
        state.line1.clear();
        state.line2.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_pins_reject_reads_before_setup() {
        let mut hw = SimulatedHardware::new();
        assert!(matches!(
            hw.read(PinId(4)),
            Err(HalError::NotConfigured(PinId(4)))
        ));
        hw.setup(PinId(4), PinDirection::Out, Some(true)).unwrap();
        assert!(hw.read(PinId(4)).unwrap());
    }

    #[test]
    fn inputs_cannot_be_written() {
        let mut hw = SimulatedHardware::new();
        hw.setup(PinId(17), PinDirection::In, None).unwrap();
        assert!(matches!(
            hw.write(PinId(17), true),
            Err(HalError::NotOutput(_))
        ));
    }

    #[test]
    fn preset_input_level_survives_setup() {
        let mut hw = SimulatedHardware::new();
        hw.set_input(PinId(22), true);
        hw.setup(PinId(22), PinDirection::In, None).unwrap();
        assert!(hw.read(PinId(22)).unwrap());
    }

    #[test]
    fn feeder_pulses_only_while_powered() {
        let mut hw = SimulatedHardware::new();
        hw.setup(PinId(25), PinDirection::Out, Some(false)).unwrap();
        let mut feeder = SimulatedFeeder::new(
            hw.clone(),
            PinId(25),
            PinId(17),
            Duration::from_millis(100),
        );

        feeder.step(Duration::from_millis(60));
        assert_eq!(hw.level(PinId(17)), Some(false));

        hw.write(PinId(25), true).unwrap();
        let mut rising = 0;
        let mut last = false;
        for _ in 0..50 {
            feeder.step(Duration::from_millis(10));
            let level = hw.level(PinId(17)).unwrap_or(false);
            if level && !last {
                rising += 1;
            }
            last = level;
        }
        assert_eq!(rising, 5);
    }

    #[test]
    fn display_records_last_lines() {
        let display = SimulatedDisplay::new();
        let mut port = display.clone();
        port.write_lines("Treats : 1/1", "Last   : 0h 3m").unwrap();
        port.set_backlight(true).unwrap();
        let snap = display.snapshot();
        assert_eq!(snap.line1, "Treats : 1/1");
        assert!(snap.backlight);
        assert_eq!(snap.writes, 1);
    }
}
