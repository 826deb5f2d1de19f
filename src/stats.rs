use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Counters for one collection run.
///
/// All counters only ever grow between resets. Times are offsets from the
/// Unix epoch as given by the sampling clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionStats {
    pub samples_collected: u64,
    /// Failed reads plus samples dropped on a full queue.
    pub errors: u64,
    pub missed_samples: u64,
    pub dropped_samples: u64,
    pub reconnects: u64,
    pub samples_per_second: f64,
    pub last_sample_time: Option<Duration>,
    pub collection_start_time: Option<Duration>,
    pub queue_len: usize,
    pub connected: bool,
}

impl CollectionStats {
    /// Seconds since the run started, measured at `now`.
    pub fn runtime(&self, now: Duration) -> Option<Duration> {
        self.collection_start_time.map(|t| now.saturating_sub(t))
    }
}

/// Shared, lock-protected statistics. Readers get copies.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<CollectionStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CollectionStats {
        self.inner.lock().clone()
    }

    pub fn reset(&self, start: Duration) {
        *self.inner.lock() = CollectionStats {
            collection_start_time: Some(start),
            ..CollectionStats::default()
        };
    }

    pub(crate) fn update<F: FnOnce(&mut CollectionStats)>(&self, f: F) {
        f(&mut self.inner.lock());
    }
}

/// Sample timestamps within the trailing window, used for the observed rate.
#[derive(Debug)]
pub struct RateWindow {
    span: Duration,
    times: VecDeque<Duration>,
}

impl RateWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            times: VecDeque::new(),
        }
    }

    pub fn record(&mut self, t: Duration) {
        self.times.push_back(t);
        self.trim(t);
    }

    /// Samples per second over `[now - span, now]`.
    pub fn rate(&mut self, now: Duration) -> f64 {
        self.trim(now);
        let secs = self.span.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.times.len() as f64 / secs
    }

    pub fn clear(&mut self) {
        self.times.clear();
    }

    fn trim(&mut self, now: Duration) {
        let cutoff = now.saturating_sub(self.span);
        while self.times.front().is_some_and(|&t| t < cutoff) {
            self.times.pop_front();
        }
    }
}
