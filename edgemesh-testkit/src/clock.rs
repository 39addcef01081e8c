use chrono::{DateTime, Duration, Utc};
use edgemesh::{Clock, IdMinter};
use parking_lot::Mutex;

/// A clock that only moves when the test says so.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::milliseconds(ms as i64));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Mints `prefix-1`, `prefix-2`, ... so test assertions can name ids.
pub struct SequentialMinter {
    prefix: String,
    next: Mutex<u64>,
}

impl SequentialMinter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: Mutex::new(1),
        }
    }
}

impl IdMinter for SequentialMinter {
    fn mint(&self) -> String {
        let mut next = self.next.lock();
        let id = format!("{}-{}", self.prefix, *next);
        *next += 1;
        id
    }
}
