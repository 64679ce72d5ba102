// Per-tracker confirm counters and optional metrics export.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::listener::ConfirmEvent;

#[cfg(feature = "telemetry")]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        NoopCounter
    };
}

#[cfg(not(feature = "telemetry"))]
#[derive(Copy, Clone)]
struct NoopCounter;

#[cfg(not(feature = "telemetry"))]
impl NoopCounter {
    fn increment(&self, _value: u64) {}
}

#[derive(Debug, Default)]
pub(crate) struct ConfirmCounters {
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    confirm_frames: AtomicU64,
    multiple_frames: AtomicU64,
    unknown_confirms: AtomicU64,
    resets: AtomicU64,
    wait_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmCountersSnapshot {
    pub published: u64,
    /// Individual sequence numbers resolved by acks (a `multiple` frame counts each).
    pub acked: u64,
    pub nacked: u64,
    pub confirm_frames: u64,
    pub multiple_frames: u64,
    pub unknown_confirms: u64,
    pub resets: u64,
    pub wait_timeouts: u64,
}

impl ConfirmCounters {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        t_counter!("felix_confirm_published_total").increment(1);
    }

    pub(crate) fn record_confirm(&self, event: &ConfirmEvent, resolved: usize) {
        let resolved = resolved as u64;
        self.confirm_frames.fetch_add(1, Ordering::Relaxed);
        if event.multiple {
            self.multiple_frames.fetch_add(1, Ordering::Relaxed);
        }
        if event.accepted {
            self.acked.fetch_add(resolved, Ordering::Relaxed);
        } else {
            self.nacked.fetch_add(resolved, Ordering::Relaxed);
        }
        t_counter!("felix_confirm_frames_total", "outcome" => event.outcome().as_str())
            .increment(1);
        t_counter!("felix_confirm_resolved_total", "outcome" => event.outcome().as_str())
            .increment(resolved);
    }

    pub(crate) fn record_unknown(&self) {
        self.unknown_confirms.fetch_add(1, Ordering::Relaxed);
        t_counter!("felix_confirm_unknown_total").increment(1);
    }

    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        t_counter!("felix_confirm_resets_total").increment(1);
    }

    pub(crate) fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
        t_counter!("felix_confirm_wait_timeouts_total").increment(1);
    }

    pub(crate) fn snapshot(&self) -> ConfirmCountersSnapshot {
        ConfirmCountersSnapshot {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            confirm_frames: self.confirm_frames.load(Ordering::Relaxed),
            multiple_frames: self.multiple_frames.load(Ordering::Relaxed),
            unknown_confirms: self.unknown_confirms.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}
