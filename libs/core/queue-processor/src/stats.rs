//! Per-run engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Lock-free counters for one worker run.
///
/// `dequeued` only ever runs ahead of `processed + errors`, so reading the resolved
/// counters before `dequeued` keeps the derived in-flight count non-negative.
#[derive(Debug, Default)]
pub struct QueueStats {
    dequeued: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dequeued: u64,
    pub processed: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub in_flight: u64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dequeued(&self, count: usize) {
        self.dequeued.fetch_add(count as u64, Ordering::SeqCst);
    }

    /// Success: bump `processed` and clear the failure streak.
    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Item failure: bump `errors` and the failure streak.
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Failure that resolves no item (transport or decode error).
    pub(crate) fn record_consecutive_error(&self) {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        let processed = self.processed.load(Ordering::SeqCst);
        let errors = self.errors.load(Ordering::SeqCst);
        let dequeued = self.dequeued.load(Ordering::SeqCst);
        dequeued.saturating_sub(processed + errors)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::SeqCst);
        let errors = self.errors.load(Ordering::SeqCst);
        let dequeued = self.dequeued.load(Ordering::SeqCst);

        StatsSnapshot {
            dequeued,
            processed,
            errors,
            consecutive_errors: self.consecutive_errors.load(Ordering::SeqCst),
            in_flight: dequeued.saturating_sub(processed + errors),
        }
    }

    /// Zero every counter at the start of a run.
    pub(crate) fn reset(&self) {
        self.dequeued.store(0, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }
}
