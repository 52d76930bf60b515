//! Wall-clock access and the gates an account worker polls between frames.
//!
//! Gates are pure: they take `now` and remember what they already fired,
//! so they are driven identically by the system clock and by tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, Timelike, Utc};

use crate::error::PersistenceError;

/// Exchange local time is UTC+09:00.
pub const MARKET_UTC_OFFSET_SECS: i32 = 9 * 3600;

pub fn market_offset() -> FixedOffset {
    FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Time of day from seconds after midnight; `None` past 23:59:59.
pub fn time_of_day(seconds_from_midnight: u32) -> Option<NaiveTime> {
    NaiveTime::from_num_seconds_from_midnight_opt(seconds_from_midnight, 0)
}

// --- Clocks -------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// System time in a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// System time in exchange local time.
    pub fn market() -> Self {
        Self::new(market_offset())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Settable clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// --- Gates --------------------------------------------------------------

/// Fires at most once per calendar day, only inside `[start, start + window)`.
#[derive(Debug, Clone)]
pub struct DailyWindowGate {
    start: NaiveTime,
    window: TimeDelta,
    last_fired: Option<NaiveDate>,
}

impl DailyWindowGate {
    pub fn new(start: NaiveTime, window: TimeDelta) -> Self {
        Self {
            start,
            window,
            last_fired: None,
        }
    }

    pub fn poll(&mut self, now: DateTime<FixedOffset>) -> bool {
        let today = now.date_naive();
        if self.last_fired == Some(today) {
            return false;
        }
        let into_window = now.time().signed_duration_since(self.start);
        if into_window < TimeDelta::zero() || into_window >= self.window {
            return false;
        }
        self.last_fired = Some(today);
        true
    }

    pub fn last_fired(&self) -> Option<NaiveDate> {
        self.last_fired
    }

    /// Carry over the day a previous run already fired on. Never moves the
    /// gate backwards.
    pub fn restore(&mut self, last_fired: Option<NaiveDate>) {
        self.last_fired = self.last_fired.max(last_fired);
    }

    /// First instant at or after `day` when the window is closed.
    pub fn window_end(&self, day: NaiveDate) -> NaiveDateTime {
        day.and_time(self.start) + self.window
    }
}

/// Fires once per `interval_minutes` slot strictly between `open` and
/// `close`. Slots are aligned to minute-of-day multiples of the interval.
#[derive(Debug, Clone)]
pub struct IntervalGate {
    interval_minutes: u32,
    open: NaiveTime,
    close: NaiveTime,
    last_slot: Option<(NaiveDate, u32)>,
}

impl IntervalGate {
    pub fn new(interval_minutes: u32, open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            interval_minutes,
            open,
            close,
            last_slot: None,
        }
    }

    pub fn poll(&mut self, now: DateTime<FixedOffset>) -> bool {
        let t = now.time();
        if self.interval_minutes == 0 || t <= self.open || t >= self.close {
            return false;
        }
        let minute_of_day = t.hour() * 60 + t.minute();
        if minute_of_day % self.interval_minutes != 0 {
            return false;
        }
        let slot = (now.date_naive(), minute_of_day);
        if self.last_slot == Some(slot) {
            return false;
        }
        self.last_slot = Some(slot);
        true
    }
}

// --- Gate records -------------------------------------------------------

/// Durable record of the last day each named daily gate fired, so a
/// restarted worker does not fire the same gate twice on one day.
pub trait GateStore: Send + Sync {
    fn last_fired(&self, gate: &str) -> Result<Option<NaiveDate>, PersistenceError>;

    /// Must be durable on `Ok`.
    fn record_fired(&self, gate: &str, day: NaiveDate) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryGateStore {
    days: Mutex<HashMap<String, NaiveDate>>,
    fail_writes: AtomicBool,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl GateStore for MemoryGateStore {
    fn last_fired(&self, gate: &str) -> Result<Option<NaiveDate>, PersistenceError> {
        let days = self
            .days
            .lock()
            .map_err(|_| PersistenceError::new(gate, "gate store lock poisoned"))?;
        Ok(days.get(gate).copied())
    }

    fn record_fired(&self, gate: &str, day: NaiveDate) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::new(gate, "injected write failure"));
        }
        self.days
            .lock()
            .map_err(|_| PersistenceError::new(gate, "gate store lock poisoned"))?
            .insert(gate.to_owned(), day);
        Ok(())
    }
}
