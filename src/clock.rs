//! Process-wide time source for event timestamps.
//!
//! Event messages are stamped at **construction** time, never at persistence
//! time, and the stamp is immutable afterwards. Every construction site reads
//! the same swappable clock: production leaves it on the system clock, test
//! harnesses pin it with [`set_fixed`] and restore it with [`reset`].
//!
//! The clock is the only ambient state the crate relies on. Writes go through
//! a `RwLock` and are expected only during setup; concurrent readers may
//! observe a stale value across a test boundary, which is acceptable there.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

enum Source {
    System,
    Fixed(DateTime<Utc>),
}

static CLOCK: RwLock<Source> = RwLock::new(Source::System);

/// Returns the current instant according to the process clock.
pub fn now() -> DateTime<Utc> {
    match *CLOCK.read().expect("clock lock poisoned") {
        Source::System => Utc::now(),
        Source::Fixed(at) => at,
    }
}

/// Pins the process clock to a fixed instant.
///
/// Every subsequently constructed event is stamped with `at` until
/// [`reset`] (or another `set_fixed`) is called.
pub fn set_fixed(at: DateTime<Utc>) {
    *CLOCK.write().expect("clock lock poisoned") = Source::Fixed(at);
}

/// Restores the system clock.
pub fn reset() {
    *CLOCK.write().expect("clock lock poisoned") = Source::System;
}
