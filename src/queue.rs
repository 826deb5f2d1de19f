use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::Measurement;
use crate::errors::{DriverError, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded FIFO between the sampling thread and its consumers.
///
/// The producer side never blocks: a full queue rejects the push. Consumers
/// either drain without blocking or wait a bounded time for one sample.
#[derive(Debug)]
pub struct SampleQueue {
    items: Mutex<VecDeque<Measurement>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append without blocking. Fails with [`DriverError::QueueFull`] when at
    /// capacity; the measurement is discarded.
    pub fn try_push(&self, measurement: Measurement) -> Result<()> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(DriverError::QueueFull);
        }
        items.push_back(measurement);
        drop(items);
        self.available.notify_one();
        Ok(())
    }

    /// Take up to `max` samples, oldest first. Never blocks on an empty queue.
    pub fn drain(&self, max: usize) -> Vec<Measurement> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Take one sample, waiting at most `timeout` for it to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Measurement> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(m) = items.pop_front() {
                return Some(m);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Empty the queue in one locked step.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes rejected because the queue was full, over its lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
