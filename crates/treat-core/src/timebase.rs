use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time for the machine.
pub trait Clock: Send {
    /// Monotonic microseconds since an arbitrary start.
    fn now_us(&self) -> u64;

    /// Wall-clock time, used for history and capture names.
    fn wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Wall-clock microseconds since Unix epoch (for cross-process logs only).
    pub fn unix_us(&self) -> u64 {
        Utc::now().timestamp_micros().max(0) as u64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TimeBase {
    fn now_us(&self) -> u64 {
        TimeBase::now_us(self)
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-advanced clock for tests and replay. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_us: Arc<AtomicU64>,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(0)),
            epoch,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_us
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn wall(&self) -> DateTime<Utc> {
        self.epoch + ChronoDuration::microseconds(self.now_us() as i64)
    }
}

/// Seconds (as configured) to microseconds, clamping negatives to zero.
pub fn secs_to_us(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1_000_000.0).round() as u64
    } else {
        0
    }
}
