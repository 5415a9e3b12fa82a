//! Capture file naming, startup recovery and retention.
//!
//! Captures are named `capture-YYYYMMDD-HHMMSS.jpg` in local time, which
//! makes lexicographic order equal to capture order.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const CAPTURE_PREFIX: &str = "capture-";
pub const CAPTURE_SUFFIX: &str = ".jpg";
pub const CAPTURE_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";
const TIMESTAMP_LEN: usize = 15;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureNameError {
    #[error("{0:?} is not a capture file name")]
    NotACapture(String),

    #[error("capture name {0:?} has no valid timestamp")]
    BadTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    pub name: String,
    pub time: DateTime<Local>,
}

pub fn capture_name_for(time: DateTime<Local>) -> String {
    format!(
        "{CAPTURE_PREFIX}{}{CAPTURE_SUFFIX}",
        time.format(CAPTURE_TIME_FORMAT)
    )
}

/// Name for a capture taken at `time` that does not clash with a file
/// already in `dir`. Captures within the same second get a counter tag.
pub fn unique_capture_name(dir: &Path, time: DateTime<Local>) -> String {
    let name = capture_name_for(time);
    if !dir.join(&name).exists() {
        return name;
    }
    let stamp = time.format(CAPTURE_TIME_FORMAT);
    let mut n = 1u32;
    loop {
        let candidate = format!("{CAPTURE_PREFIX}{stamp}-{n:02}{CAPTURE_SUFFIX}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Sort key that puts `capture-X.jpg` before `capture-X-01.jpg`.
fn capture_order(name: &str) -> &str {
    name.strip_suffix(CAPTURE_SUFFIX).unwrap_or(name)
}

fn is_capture_file(name: &str) -> bool {
    name.starts_with(CAPTURE_PREFIX) && name.ends_with(CAPTURE_SUFFIX)
}

/// Tags are plain words, so a capture name never carries a path.
fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Recover the capture time embedded in a file name.
///
/// Names written by an external daemon may carry a trailing tag
/// (`capture-20240301-120000-snapshot.jpg`); only the timestamp is read.
pub fn parse_capture_name(name: &str) -> Result<CaptureRecord, CaptureNameError> {
    if !is_capture_file(name) {
        return Err(CaptureNameError::NotACapture(name.to_string()));
    }
    let bad = || CaptureNameError::BadTimestamp(name.to_string());
    let stem = &name[CAPTURE_PREFIX.len()..];
    let body = stem.strip_suffix(CAPTURE_SUFFIX).ok_or_else(bad)?;
    let stamp = body.get(..TIMESTAMP_LEN).ok_or_else(bad)?;
    let rest = &body[TIMESTAMP_LEN..];
    if let Some(tag) = rest.strip_prefix('-') {
        if !is_valid_tag(tag) {
            return Err(bad());
        }
    } else if !rest.is_empty() {
        return Err(bad());
    }
    let naive = NaiveDateTime::parse_from_str(stamp, CAPTURE_TIME_FORMAT).map_err(|_| bad())?;
    let time = Local.from_local_datetime(&naive).earliest().ok_or_else(bad)?;
    Ok(CaptureRecord {
        name: name.to_string(),
        time,
    })
}

/// Capture file names in `dir`, oldest first.
pub fn list_captures(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_capture_file(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort_by(|a, b| capture_order(a).cmp(capture_order(b)));
    Ok(names)
}

/// The newest capture already on disk, if its name can be parsed.
pub fn find_last_capture(dir: &Path) -> Option<CaptureRecord> {
    let names = match list_captures(dir) {
        Ok(names) => names,
        Err(e) => {
            warn!("Unable to scan capture directory {}: {}", dir.display(), e);
            return None;
        }
    };
    let name = names.last()?;
    match parse_capture_name(name) {
        Ok(record) => {
            info!("Recovering {} at startup as last capture file", record.name);
            Some(record)
        }
        Err(e) => {
            warn!("Unable to determine last capture file: {}", e);
            None
        }
    }
}

/// Delete the oldest captures so that at most `retain` remain. Returns the
/// names that were removed.
pub fn trim_excess_captures(dir: &Path, retain: usize) -> io::Result<Vec<String>> {
    let names = list_captures(dir)?;
    let excess = names.len().saturating_sub(retain);
    let mut removed = Vec::with_capacity(excess);
    for name in names.into_iter().take(excess) {
        info!("Trimming: {}", name);
        match fs::remove_file(dir.join(&name)) {
            Ok(()) => removed.push(name),
            Err(e) => warn!("Failed to trim {}: {}", name, e),
        }
    }
    Ok(removed)
}
