//! Rolling record of dispense cycles over the trailing 24 hours.
//!
//! Events are optionally persisted as a JSON array so that statistics
//! survive restarts. A missing or unreadable file is logged and the history
//! starts empty.

use crate::hal::{HistoryPort, TreatStats};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatEvent {
    pub time: DateTime<Utc>,
    pub treat_count: u32,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read history from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("history file {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write history to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn window() -> ChronoDuration {
    ChronoDuration::hours(24)
}

#[derive(Debug, Default)]
pub struct TreatHistory {
    events: VecDeque<TreatEvent>,
    path: Option<PathBuf>,
}

impl TreatHistory {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a persisted history. Load failures leave the history empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let events = match Self::load(&path) {
            Ok(events) => events,
            Err(e) => {
                warn!("{}; treat history will start empty", e);
                Vec::new()
            }
        };
        let mut events: VecDeque<TreatEvent> = events.into();
        events.make_contiguous().sort_by_key(|e| e.time);
        Self {
            events,
            path: Some(path),
        }
    }

    pub fn load(path: &Path) -> Result<Vec<TreatEvent>, HistoryError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Treat history not present at {}", path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(HistoryError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| HistoryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the history next to its target and rename it into place.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write_err = |source| HistoryError::Write {
            path: path.clone(),
            source,
        };
        let events: Vec<&TreatEvent> = self.events.iter().collect();
        let body = serde_json::to_vec(&events).map_err(|e| write_err(io::Error::other(e)))?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)
    }

    pub fn record(&mut self, treat_count: u32, now: DateTime<Utc>) {
        info!("Recording dispense cycle with {} treats", treat_count);
        self.events.push_back(TreatEvent {
            time: now,
            treat_count,
        });
        self.prune(now);
        if let Err(e) = self.save() {
            warn!("{}", e);
        }
    }

    /// Drop events that are 24 hours old or older. Events are kept in order.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.events.front() {
            if now - front.time >= window() {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn stats(&mut self, now: DateTime<Utc>) -> TreatStats {
        self.prune(now);
        TreatStats {
            cycle_count: self.events.len() as u32,
            treat_count: self.events.iter().map(|e| e.treat_count).sum(),
            last_dispense: self.events.back().map(|e| e.time),
        }
    }

    pub fn num_treats_in_last_24_hours(&mut self, now: DateTime<Utc>) -> u32 {
        self.stats(now).treat_count
    }

    pub fn events(&self) -> impl Iterator<Item = &TreatEvent> {
        self.events.iter()
    }
}

impl HistoryPort for TreatHistory {
    fn record_dispense(&mut self, count: u32, now: DateTime<Utc>) {
        self.record(count, now);
    }

    fn stats(&mut self, now: DateTime<Utc>) -> TreatStats {
        TreatHistory::stats(self, now)
    }
}
