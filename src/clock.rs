// Time source for entry timestamps and rotation checks

use chrono::{DateTime, Days, Local, NaiveDate};
use std::sync::RwLock;

/// Source of the current zoned time
pub trait Clock: Send + Sync {
    /// Current local date-time
    fn now(&self) -> DateTime<Local>;

    /// Current local calendar date
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Clock backed by the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that only moves when told to
///
/// Used to exercise date-based rotation without waiting for real days to pass.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Local>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Create a clock frozen at the current system time
    pub fn starting_now() -> Self {
        Self::new(Local::now())
    }

    /// Replace the current time
    pub fn set(&self, now: DateTime<Local>) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    /// Move the clock forward by whole days
    pub fn advance_days(&self, days: u64) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = guard.checked_add_days(Days::new(days)) {
            *guard = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
