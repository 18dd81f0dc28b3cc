//! Milliseconds-since-epoch clock, pinnable for tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of `now_ms` for every scripted operation.
///
/// Production code uses [`Clock::system`]; tests pin time with
/// [`Clock::fixed`] and advance it explicitly, which makes delayed
/// promotion and lease expiry deterministic.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    /// A clock frozen at `now_ms` until advanced.
    pub fn fixed(now_ms: i64) -> Self {
        Clock::Fixed(Arc::new(AtomicI64::new(now_ms)))
    }

    pub fn now_ms(&self) -> i64 {
        match self {
            Clock::System => Utc::now().timestamp_millis(),
            Clock::Fixed(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Advance a fixed clock; no-op on the system clock.
    pub fn advance_ms(&self, delta: i64) {
        if let Clock::Fixed(ms) = self {
            ms.fetch_add(delta, Ordering::SeqCst);
        }
    }
}
