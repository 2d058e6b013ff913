//! Per-model inference statistics.
//!
//! Counters are updated by producers and workers without taking the
//! scheduler lock. [`ModelStatistics::snapshot`] returns a serializable copy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::completion::RequestStats;
use crate::error::RequestError;

/// Live counters for one model.
#[derive(Debug, Default)]
pub struct ModelStatistics {
    success: AtomicU64,
    failure: AtomicU64,
    batches: AtomicU64,
    executed: AtomicU64,
    queue_ns: AtomicU64,
    compute_ns: AtomicU64,
    failures: Mutex<BTreeMap<&'static str, u64>>,
    batch_sizes: Mutex<BTreeMap<usize, u64>>,
}

impl ModelStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_success(&self, stats: &RequestStats) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.queue_ns
            .fetch_add(duration_ns(stats.queue), Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &RequestError) {
        self.failure.fetch_add(1, Ordering::Relaxed);
        *self.failures.lock().entry(error.code()).or_default() += 1;
    }

    /// One backend call covering `size` real requests.
    pub(crate) fn record_batch(&self, size: usize, compute: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.executed.fetch_add(size as u64, Ordering::Relaxed);
        self.compute_ns
            .fetch_add(duration_ns(compute), Ordering::Relaxed);
        *self.batch_sizes.lock().entry(size).or_default() += 1;
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            success_count: self.success.load(Ordering::Relaxed),
            failure_count: self.failure.load(Ordering::Relaxed),
            failures: self
                .failures
                .lock()
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            batch_count: self.batches.load(Ordering::Relaxed),
            execution_count: self.executed.load(Ordering::Relaxed),
            cumulative_queue_ns: self.queue_ns.load(Ordering::Relaxed),
            cumulative_compute_ns: self.compute_ns.load(Ordering::Relaxed),
            batch_sizes: self.batch_sizes.lock().clone(),
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Point-in-time copy of [`ModelStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Requests completed with a response.
    pub success_count: u64,
    /// Requests completed with an error, rejections included.
    pub failure_count: u64,
    /// Failure count per error code.
    pub failures: BTreeMap<String, u64>,
    /// Backend calls.
    pub batch_count: u64,
    /// Real requests handed to the backend.
    pub execution_count: u64,
    /// Summed queue time of successful requests.
    pub cumulative_queue_ns: u64,
    /// Summed backend time of all batches.
    pub cumulative_compute_ns: u64,
    /// Batch size histogram.
    pub batch_sizes: BTreeMap<usize, u64>,
}

impl StatisticsSnapshot {
    /// Requests that reached a terminal state.
    pub fn completed(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn average_batch_size(&self) -> f64 {
        if self.batch_count == 0 {
            return 0.0;
        }
        self.execution_count as f64 / self.batch_count as f64
    }

    pub fn failures_for(&self, error: &RequestError) -> u64 {
        self.failures.get(error.code()).copied().unwrap_or(0)
    }
}
