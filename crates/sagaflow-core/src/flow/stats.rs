//! Engine-wide run counters and rolling duration history.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Completed/failed totals plus the most recent run durations.
///
/// Totals are monotonic; the duration window evicts its oldest entry once
/// `limit` is reached.
#[derive(Debug)]
pub struct StatsTracker {
    completed: AtomicU64,
    failed: AtomicU64,
    durations: Mutex<VecDeque<u64>>,
    limit: usize,
}

impl StatsTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            durations: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit: limit.max(1),
        }
    }

    pub fn record_completed(&self, duration_ms: Option<u64>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.push_duration(duration_ms);
    }

    pub fn record_failed(&self, duration_ms: Option<u64>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.push_duration(duration_ms);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Mean over the duration window, `0.0` when empty.
    pub fn avg_duration_ms(&self) -> f64 {
        let durations = self.durations.lock().expect("stats lock poisoned");
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().map(|&d| d as f64).sum::<f64>() / durations.len() as f64
    }

    fn push_duration(&self, duration_ms: Option<u64>) {
        let Some(duration_ms) = duration_ms else {
            return;
        };
        let mut durations = self.durations.lock().expect("stats lock poisoned");
        durations.push_back(duration_ms);
        while durations.len() > self.limit {
            durations.pop_front();
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}
