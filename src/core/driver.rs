//! Purpose: Contracts for state the driver owns and the publication only observes.
//! Exports: `PositionReader`, `AtomicCounter`, `EpochClock`, `SystemEpochClock`, `Conductor`,
//! `NoopConductor`.
//! Role: Seams between the append path and the out-of-process driver / registration protocol.
//! Invariants: The publication only ever reads counters, with acquire ordering.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

/// Read side of a driver-maintained 64-bit position counter (e.g. the publication limit).
pub trait PositionReader: Send + Sync {
    fn get_volatile(&self) -> i64;
}

/// Position counter held in process memory and shared by `Arc`.
#[derive(Clone, Default)]
pub struct AtomicCounter {
    value: Arc<AtomicI64>,
}

impl AtomicCounter {
    pub fn new(initial: i64) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(initial)),
        }
    }

    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Moves the counter forward only; returns the value now held.
    pub fn advance_to(&self, value: i64) -> i64 {
        self.value.fetch_max(value, Ordering::AcqRel).max(value)
    }
}

impl PositionReader for AtomicCounter {
    fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicCounter")
            .field(&self.get_volatile())
            .finish()
    }
}

/// Milliseconds since the Unix epoch; the unit the driver stamps status messages with.
pub trait EpochClock: Send + Sync {
    fn time_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// The client side of the registration protocol, as far as a publication needs it.
pub trait Conductor: Send + Sync {
    fn release_publication(&self, registration_id: i64);
}

/// For logs used without a driver (tests, the CLI).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopConductor;

impl Conductor for NoopConductor {
    fn release_publication(&self, registration_id: i64) {
        tracing::debug!(registration_id, "publication released without a driver");
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicCounter, EpochClock, PositionReader, SystemEpochClock};

    #[test]
    fn counter_clones_share_state() {
        let counter = AtomicCounter::new(0);
        let observer = counter.clone();
        counter.set_ordered(4096);
        assert_eq!(observer.get_volatile(), 4096);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let counter = AtomicCounter::new(100);
        assert_eq!(counter.advance_to(50), 100);
        assert_eq!(counter.advance_to(200), 200);
        assert_eq!(counter.get_volatile(), 200);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemEpochClock.time_ms() > 1_577_836_800_000);
    }
}
