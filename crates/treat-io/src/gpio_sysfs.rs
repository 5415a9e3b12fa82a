//! Unprivileged GPIO access through the kernel's sysfs interface.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use treat_core::hal::{HalError, HardwarePort, PinDirection, PinId};

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// udev fixes the permissions of a freshly exported pin shortly after the
/// pin directory appears; writes in that window fail with EACCES.
#[derive(Debug, Clone, Copy)]
pub struct PermissionRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for PermissionRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

pub enum RetryOutcome<T> {
    Done(T),
    Exhausted,
}

/// Run `op` until it stops failing with `PermissionDenied`.
pub fn retry_permission<T>(
    retry: PermissionRetry,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<RetryOutcome<T>> {
    for attempt in 1..=retry.attempts {
        match op() {
            Ok(value) => return Ok(RetryOutcome::Done(value)),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(attempt, "permission denied, retrying");
                if attempt < retry.attempts {
                    thread::sleep(retry.delay);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(RetryOutcome::Exhausted)
}

pub struct SysfsGpio {
    root: PathBuf,
    retry: PermissionRetry,
    pins: HashMap<PinId, PinDirection>,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry: PermissionRetry::default(),
            pins: HashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: PermissionRetry) -> Self {
        self.retry = retry;
        self
    }

    fn pin_dir(&self, pin: PinId) -> PathBuf {
        self.root.join(format!("gpio{}", pin.0))
    }

    fn write_control(&self, file: &str, pin: PinId) -> Result<(), HalError> {
        fs::write(self.root.join(file), pin.0.to_string())
            .map_err(|source| HalError::Pin { pin, source })
    }

    fn export(&self, pin: PinId) -> Result<(), HalError> {
        if self.pin_dir(pin).exists() {
            warn!(pin = %pin, "pin already exported; reconfiguring it");
            return Ok(());
        }
        self.write_control("export", pin)
    }

    fn unexport(&self, pin: PinId) -> Result<(), HalError> {
        if self.pin_dir(pin).exists() {
            self.write_control("unexport", pin)?;
        }
        Ok(())
    }

    fn checked(&self, pin: PinId) -> Result<PinDirection, HalError> {
        self.pins
            .get(&pin)
            .copied()
            .ok_or(HalError::NotConfigured(pin))
    }

    fn value_path(&self, pin: PinId) -> PathBuf {
        self.pin_dir(pin).join("value")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

fn direction_word(direction: PinDirection, initial: Option<bool>) -> &'static str {
    match (direction, initial) {
        (PinDirection::In, _) => "in",
        (PinDirection::Out, None) => "out",
        (PinDirection::Out, Some(false)) => "low",
        (PinDirection::Out, Some(true)) => "high",
    }
}

impl HardwarePort for SysfsGpio {
    fn setup(
        &mut self,
        pin: PinId,
        direction: PinDirection,
        initial: Option<bool>,
    ) -> Result<(), HalError> {
        if !self.pins.contains_key(&pin) {
            self.export(pin)?;
        }
        self.pins.insert(pin, direction);

        let path = self.pin_dir(pin).join("direction");
        let word = direction_word(direction, initial);
        match retry_permission(self.retry, || fs::write(&path, word)) {
            Ok(RetryOutcome::Done(())) => {
                info!(pin = %pin, direction = word, "pin configured");
                Ok(())
            }
            Ok(RetryOutcome::Exhausted) => Err(HalError::PermissionTimeout {
                pin,
                attempts: self.retry.attempts,
            }),
            Err(source) => Err(HalError::Pin { pin, source }),
        }
    }

    fn read(&mut self, pin: PinId) -> Result<bool, HalError> {
        self.checked(pin)?;
        let raw = fs::read_to_string(self.value_path(pin))
            .map_err(|source| HalError::Pin { pin, source })?;
        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(HalError::InvalidValue {
                pin,
                value: other.to_string(),
            }),
        }
    }

    fn write(&mut self, pin: PinId, value: bool) -> Result<(), HalError> {
        if self.checked(pin)? != PinDirection::Out {
            return Err(HalError::NotOutput(pin));
        }
        fs::write(self.value_path(pin), if value { "1" } else { "0" })
            .map_err(|source| HalError::Pin { pin, source })
    }

    fn release(&mut self, pin: PinId) -> Result<(), HalError> {
        if self.pins.remove(&pin).is_none() {
            return Err(HalError::NotConfigured(pin));
        }
        self.unexport(pin)
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        let pins: Vec<PinId> = self.pins.keys().copied().collect();
        for pin in pins {
            if let Err(e) = self.release(pin) {
                warn!(pin = %pin, error = %e, "failed to release pin");
            }
        }
    }
}
