//! Wall-clock abstraction.
//!
//! Session expiry, ticket TTLs and verifier pacing all compare absolute epoch
//! milliseconds, so every component reads time through this trait.

use chrono::Utc;

pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
