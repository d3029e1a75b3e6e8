use crate::expire::ExpiryTimer;
use std::time::{SystemTime, UNIX_EPOCH};

/// A value in the cache map plus its pending expiration, if any.
#[derive(Debug)]
pub struct CacheEntry {
    pub value: String,
    /// Distinguishes this installation of the key from earlier and later ones.
    pub generation: u64,
    timer: Option<ExpiryTimer>,
}

impl CacheEntry {
    pub fn new(value: impl Into<String>, generation: u64) -> Self {
        CacheEntry {
            value: value.into(),
            generation,
            timer: None,
        }
    }

    pub fn with_timer(value: impl Into<String>, generation: u64, timer: ExpiryTimer) -> Self {
        CacheEntry {
            value: value.into(),
            generation,
            timer: Some(timer),
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Stop the pending expiration. Safe to call after the timer has fired.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Get current time in nanoseconds since UNIX epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as i64
}

/// Get current time in seconds since UNIX epoch.
pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}
