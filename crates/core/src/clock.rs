//! Injectable time source.
//!
//! Every "is it time yet?" decision in the scheduler goes through [`Clock`] so
//! that tests can freeze and advance time deterministically. All instants are
//! `DateTime<Utc>`, which keeps comparisons independent of local DST rules.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Time port.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// `true` if `t` is at or before now.
    fn is_past_or_now(&self, t: DateTime<Utc>) -> bool {
        t <= self.now()
    }

    /// `true` only if `t > now - grace`.
    ///
    /// A grace reaching past the earliest representable instant accepts
    /// every `t`.
    fn is_future(&self, t: DateTime<Utc>, grace: Duration) -> bool {
        match self.now().checked_sub_signed(grace) {
            Some(floor) => t > floor,
            None => true,
        }
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = t;
    }

    /// Move time forward (or backward, for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
