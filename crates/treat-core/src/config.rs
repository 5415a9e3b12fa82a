use crate::hal::PinId;
use crate::timebase::secs_to_us;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a positive number of seconds, got {value}")]
    NonPositiveDuration { field: &'static str, value: f64 },

    #[error("pin {0} is assigned to more than one function")]
    DuplicatePin(PinId),

    #[error("captures_to_retain must be at least 1")]
    NothingRetained,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinAssignments {
    pub treat_detector: PinId,
    pub button: PinId,
    pub treat_power: PinId,
}

impl Default for PinAssignments {
    fn default() -> Self {
        Self {
            treat_detector: PinId(17),
            button: PinId(22),
            treat_power: PinId(25),
        }
    }
}

/// Timing and wiring of the dispenser. Loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenserConfig {
    /// 0 disables the per-cycle limit.
    pub max_treats_per_cycle: u32,
    pub button_hold_for_treat_secs: f64,
    pub return_to_idle_secs: f64,
    pub treat_enabled_secs: f64,
    pub treat_recovery_secs: f64,
    pub post_cycle_secs: f64,
    pub button_poll_secs: f64,
    pub treat_poll_secs: f64,
    pub stats_refresh_secs: f64,
    /// The button pulls its line low when pressed.
    pub button_active_low: bool,
    pub pins: PinAssignments,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            max_treats_per_cycle: 0,
            button_hold_for_treat_secs: 2.0,
            return_to_idle_secs: 10.0,
            treat_enabled_secs: 10.0,
            treat_recovery_secs: 50.0,
            post_cycle_secs: 1.0,
            button_poll_secs: 0.1,
            treat_poll_secs: 0.02,
            stats_refresh_secs: 60.0,
            button_active_low: true,
            pins: PinAssignments::default(),
        }
    }
}

impl DispenserConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("button_hold_for_treat_secs", self.button_hold_for_treat_secs),
            ("return_to_idle_secs", self.return_to_idle_secs),
            ("treat_enabled_secs", self.treat_enabled_secs),
            ("treat_recovery_secs", self.treat_recovery_secs),
            ("button_poll_secs", self.button_poll_secs),
            ("treat_poll_secs", self.treat_poll_secs),
        ];
        for (field, value) in durations {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositiveDuration { field, value });
            }
        }
        if !(self.post_cycle_secs.is_finite() && self.post_cycle_secs >= 0.0) {
            return Err(ConfigError::NonPositiveDuration {
                field: "post_cycle_secs",
                value: self.post_cycle_secs,
            });
        }

        let pins = self.pins;
        if pins.treat_detector == pins.button || pins.treat_detector == pins.treat_power {
            return Err(ConfigError::DuplicatePin(pins.treat_detector));
        }
        if pins.button == pins.treat_power {
            return Err(ConfigError::DuplicatePin(pins.button));
        }
        Ok(())
    }

    pub fn button_poll_interval(&self) -> Duration {
        Duration::from_micros(secs_to_us(self.button_poll_secs))
    }

    pub fn treat_poll_interval(&self) -> Duration {
        Duration::from_micros(secs_to_us(self.treat_poll_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// An external capture daemon is asked for a snapshot over HTTP.
    #[default]
    Snapshot,
    /// The engine runs its own low-res motion loop and full captures.
    Motion,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub control_host: String,
    pub control_port: u16,
    pub last_capture_link: String,
    pub watch_interval_secs: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            control_host: "localhost".to_string(),
            control_port: 8001,
            last_capture_link: "lastsnap.jpg".to_string(),
            watch_interval_secs: 0.1,
        }
    }
}

impl SnapshotConfig {
    pub fn snapshot_url(&self) -> String {
        format!(
            "http://{}:{}/0/action/snapshot",
            self.control_host, self.control_port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub motion_interval_secs: f64,
    pub motion_capture_program: String,
    pub motion_capture_args: Vec<String>,
    pub motion_auto_disable_secs: f64,
    pub motion_threshold: u8,
    pub motion_sensitivity: u32,
    pub capture_program: String,
    /// The capture path is appended after these.
    pub capture_args: Vec<String>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        let split = |s: &str| s.split_whitespace().map(str::to_string).collect();
        Self {
            motion_interval_secs: 0.5,
            motion_capture_program: "/usr/bin/raspistill".to_string(),
            motion_capture_args: split("-w 100 -h 75 -t 0 -n -e bmp -o -"),
            motion_auto_disable_secs: 600.0,
            motion_threshold: 10,
            motion_sensitivity: 30,
            capture_program: "/usr/bin/raspistill".to_string(),
            capture_args: split("-w 648 -h 486 -t 0 -n -e jpg -q 15 -o"),
        }
    }
}

impl MotionConfig {
    pub fn motion_interval(&self) -> Duration {
        Duration::from_micros(secs_to_us(self.motion_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub strategy: CaptureStrategy,
    pub capture_dir: PathBuf,
    pub captures_to_retain: usize,
    /// How long a single capture request waits before giving up.
    pub request_timeout_secs: f64,
    pub snapshot: SnapshotConfig,
    pub motion: MotionConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            strategy: CaptureStrategy::default(),
            capture_dir: PathBuf::from("captures"),
            captures_to_retain: 100,
            request_timeout_secs: 2.0,
            snapshot: SnapshotConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.captures_to_retain == 0 {
            return Err(ConfigError::NothingRetained);
        }
        let durations = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("watch_interval_secs", self.snapshot.watch_interval_secs),
            ("motion_interval_secs", self.motion.motion_interval_secs),
            (
                "motion_auto_disable_secs",
                self.motion.motion_auto_disable_secs,
            ),
        ];
        for (field, value) in durations {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositiveDuration { field, value });
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_micros(secs_to_us(self.request_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DispenserConfig::default().validate().is_ok());
        assert!(CaptureConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_shared_pins() {
        let mut cfg = DispenserConfig::default();
        cfg.pins.button = cfg.pins.treat_power;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DuplicatePin(cfg.pins.button))
        );
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let cfg = DispenserConfig {
            treat_poll_secs: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveDuration {
                field: "treat_poll_secs",
                ..
            })
        ));
    }

    #[test]
    fn zero_post_cycle_is_allowed() {
        let cfg = DispenserConfig {
            post_cycle_secs: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn snapshot_url_uses_control_port() {
        let cfg = SnapshotConfig::default();
        assert_eq!(cfg.snapshot_url(), "http://localhost:8001/0/action/snapshot");
    }
}
