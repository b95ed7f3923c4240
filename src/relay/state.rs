use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_TELEMETRY_CYCLE_MS: u64 = 5000;

/// Time between two telemetry publications, shared between the loop and the
/// twin handler.
#[derive(Debug)]
pub struct Cadence {
    interval_ms: AtomicU64,
}

impl Cadence {
    pub fn new(interval_ms: NonZeroU64) -> Self {
        Self {
            interval_ms: AtomicU64::new(interval_ms.get()),
        }
    }

    /// Replace the interval, returning the previous one in milliseconds.
    pub fn set(&self, interval_ms: NonZeroU64) -> u64 {
        self.interval_ms.swap(interval_ms.get(), Ordering::Relaxed)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms())
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            interval_ms: AtomicU64::new(DEFAULT_TELEMETRY_CYCLE_MS),
        }
    }
}

/// Diagnostic totals of the relay's traffic.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    sent: AtomicU64,
    received: AtomicU64,
    confirmed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub sent: u64,
    pub received: u64,
    pub confirmed: u64,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one telemetry publication; returns the new total.
    pub fn record_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_confirmed(&self) -> u64 {
        self.confirmed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
        }
    }
}
