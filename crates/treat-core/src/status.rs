//! Read-only projections of machine, history and capture state: the JSON
//! status document and the two statistics lines shown on the display.

use crate::capture_name::CaptureRecord;
use crate::hal::TreatStats;
use crate::machine::StateKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NOT_RUNNING: &str = "NotRunning";
pub const CAPTURE_URL_PREFIX: &str = "/captures/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusProjection {
    pub last_treat_time: String,
    pub treats_in_24h: u32,
    pub cycles_in_24h: u32,
    /// -1 when nothing was dispensed in the last 24 hours.
    pub hours_since_last_treat: i64,
    pub minutes_since_last_treat: i64,
    pub current_state_name: String,
    pub last_capture_time: String,
    pub last_capture_path: String,
}

impl StatusProjection {
    pub fn build(
        stats: &TreatStats,
        state: Option<StateKind>,
        capture: Option<&CaptureRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let (hours, minutes) = stats
            .last_dispense
            .map(|last| elapsed_hours_minutes(last, now))
            .unwrap_or((-1, -1));
        Self {
            last_treat_time: stats.last_dispense.map(json_time).unwrap_or_default(),
            treats_in_24h: stats.treat_count,
            cycles_in_24h: stats.cycle_count,
            hours_since_last_treat: hours,
            minutes_since_last_treat: minutes,
            current_state_name: state
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| NOT_RUNNING.to_string()),
            last_capture_time: capture
                .map(|c| json_time(c.time.with_timezone(&Utc)))
                .unwrap_or_default(),
            last_capture_path: capture.map(|c| capture_path(&c.name)).unwrap_or_default(),
        }
    }
}

pub fn json_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()
}

pub fn capture_path(name: &str) -> String {
    format!("{CAPTURE_URL_PREFIX}{name}")
}

/// Whole hours, then the remaining whole minutes.
pub fn elapsed_hours_minutes(since: DateTime<Utc>, now: DateTime<Utc>) -> (i64, i64) {
    let secs = (now - since).num_seconds().max(0);
    (secs / 3600, (secs % 3600) / 60)
}

pub fn format_lcd_stats(stats: &TreatStats, now: DateTime<Utc>) -> (String, String) {
    let line1 = format!("Treats : {}/{}", stats.treat_count, stats.cycle_count);
    let line2 = match stats.last_dispense {
        Some(last) => {
            let (h, m) = elapsed_hours_minutes(last, now);
            format!("Last   : {h}h {m}m")
        }
        None => "Last   : > 24h".to_string(),
    };
    (line1, line2)
}
