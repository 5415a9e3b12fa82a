//! Two-line character LCD driven over a serial device.
//!
//! The port speed is configured outside the process (for example with
//! `stty`); this adapter only writes the display's command bytes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::info;
use treat_core::hal::{DisplayMode, DisplayPort, HalError};

pub const LINE_WIDTH: usize = 16;
pub const DEFAULT_DEVICE: &str = "/dev/ttyAMA0";

const CLEAR: u8 = 0x0C;
const BACKLIGHT_ON: u8 = 0x11;
const BACKLIGHT_OFF: u8 = 0x12;
const HOME: u8 = 0x80;
const DISPLAY_OFF: u8 = 0x15;
const DISPLAY_ON: u8 = 0x16;
const DISPLAY_ON_BLINK: u8 = 0x17;
const DISPLAY_ON_CURSOR: u8 = 0x18;
const DISPLAY_ON_CURSOR_BLINK: u8 = 0x19;

/// The controller needs a moment after a clear before it accepts text.
const CLEAR_SETTLE: Duration = Duration::from_millis(10);

pub struct SerialLcd<W: Write + Send> {
    port: W,
}

impl SerialLcd<File> {
    pub fn open(device: &Path) -> Result<Self, HalError> {
        let port = OpenOptions::new()
            .write(true)
            .open(device)
            .map_err(HalError::Display)?;
        info!(device = %device.display(), "serial LCD opened");
        Ok(Self::new(port))
    }
}

impl<W: Write + Send> SerialLcd<W> {
    pub fn new(port: W) -> Self {
        Self { port }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), HalError> {
        self.port.write_all(bytes).map_err(HalError::Display)?;
        self.port.flush().map_err(HalError::Display)
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}

/// Pad or cut `line` to exactly one display line.
pub fn fit_line(line: &str) -> String {
    let mut out: String = line.chars().take(LINE_WIDTH).collect();
    let len = out.chars().count();
    out.extend(std::iter::repeat(' ').take(LINE_WIDTH - len));
    out
}

pub fn mode_code(mode: DisplayMode) -> u8 {
    match (mode.display, mode.cursor, mode.blink) {
        (false, _, _) => DISPLAY_OFF,
        (true, false, false) => DISPLAY_ON,
        (true, false, true) => DISPLAY_ON_BLINK,
        (true, true, false) => DISPLAY_ON_CURSOR,
        (true, true, true) => DISPLAY_ON_CURSOR_BLINK,
    }
}

impl<W: Write + Send> DisplayPort for SerialLcd<W> {
    fn write_lines(&mut self, line1: &str, line2: &str) -> Result<(), HalError> {
        let mut frame = Vec::with_capacity(1 + 2 * LINE_WIDTH);
        frame.push(HOME);
        frame.extend_from_slice(fit_line(line1).as_bytes());
        frame.extend_from_slice(fit_line(line2).as_bytes());
        self.send(&frame)
    }

    fn set_backlight(&mut self, on: bool) -> Result<(), HalError> {
        self.send(&[if on { BACKLIGHT_ON } else { BACKLIGHT_OFF }])
    }

    fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), HalError> {
        self.send(&[mode_code(mode)])
    }

    fn clear(&mut self) -> Result<(), HalError> {
        self.send(&[CLEAR])?;
        thread::sleep(CLEAR_SETTLE);
        Ok(())
    }
}
