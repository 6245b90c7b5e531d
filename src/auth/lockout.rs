use time::{Duration, OffsetDateTime};

use crate::config::LockoutConfig;

/// Outcome of a failed password attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDecision {
    pub attempts_left: i32,
    pub lock_until: Option<OffsetDateTime>,
}

/// Maps the failed-attempt counter to a lock decision. Holds no state.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    max_attempts: i32,
    lock_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lock_duration: Duration::seconds(60),
        }
    }
}

impl LockoutPolicy {
    pub fn from_config(cfg: &LockoutConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            lock_duration: Duration::seconds(cfg.duration_secs.max(0)),
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// When a lock imposed at `now` lifts.
    pub fn lock_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.lock_duration
    }

    /// `attempts` is the counter after the failure was recorded.
    pub fn decide(&self, attempts: i32, now: OffsetDateTime) -> LockDecision {
        LockDecision {
            attempts_left: (self.max_attempts - attempts).max(0),
            lock_until: (attempts >= self.max_attempts).then(|| self.lock_at(now)),
        }
    }

    /// Whole seconds until the lock lifts, rounded up; `None` once it has passed.
    pub fn remaining(&self, lock_until: Option<OffsetDateTime>, now: OffsetDateTime) -> Option<i64> {
        let until = lock_until?;
        if now >= until {
            return None;
        }
        let millis = (until - now).whole_milliseconds();
        Some(((millis + 999) / 1000) as i64)
    }
}
