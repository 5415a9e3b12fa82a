use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// GPIO line number as exposed by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u16);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    In,
    Out,
}

/// Display/cursor/blink combination understood by the character display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayMode {
    pub display: bool,
    pub cursor: bool,
    pub blink: bool,
}

impl DisplayMode {
    pub const TEXT_ONLY: Self = Self {
        display: true,
        cursor: false,
        blink: false,
    };
}

#[derive(Debug, Error)]
pub enum HalError {
    #[error("{0} has not been set up")]
    NotConfigured(PinId),

    #[error("{0} is not configured for output")]
    NotOutput(PinId),

    #[error("unable to set direction of {pin} after {attempts} attempts")]
    PermissionTimeout { pin: PinId, attempts: u32 },

    #[error("unexpected value {value:?} read from {pin}")]
    InvalidValue { pin: PinId, value: String },

    #[error("I/O error on {pin}: {source}")]
    Pin {
        pin: PinId,
        #[source]
        source: std::io::Error,
    },

    #[error("display I/O error: {0}")]
    Display(#[source] std::io::Error),
}

/// Rolling 24 hour treat statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreatStats {
    pub cycle_count: u32,
    pub treat_count: u32,
    pub last_dispense: Option<DateTime<Utc>>,
}

/// The three semantic pins: treat detector, button and dispenser power.
pub trait HardwarePort: Send {
    fn setup(
        &mut self,
        pin: PinId,
        direction: PinDirection,
        initial: Option<bool>,
    ) -> Result<(), HalError>;
    fn read(&mut self, pin: PinId) -> Result<bool, HalError>;
    fn write(&mut self, pin: PinId, value: bool) -> Result<(), HalError>;
    fn release(&mut self, pin: PinId) -> Result<(), HalError>;
}

/// Two line, 16 character display with a switchable backlight.
pub trait DisplayPort: Send {
    fn write_lines(&mut self, line1: &str, line2: &str) -> Result<(), HalError>;
    fn set_backlight(&mut self, on: bool) -> Result<(), HalError>;
    fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), HalError>;
    fn clear(&mut self) -> Result<(), HalError>;
}

pub trait HistoryPort: Send {
    fn record_dispense(&mut self, count: u32, now: DateTime<Utc>);
    fn stats(&mut self, now: DateTime<Utc>) -> TreatStats;
}
