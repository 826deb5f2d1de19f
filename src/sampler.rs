//! Paced sampling of a DP100 on a dedicated thread.
//!
//! # Timing
//!
//! Sample targets are spaced by `1 / rate`. The loop sleeps toward the next
//! target in short slices (so `stop()` is noticed quickly), takes the sample,
//! and advances the target by one interval. When a sample is taken a full
//! interval or more after its target, the skipped slots are counted as
//! missed and the schedule restarts from the current time, so a stall never
//! turns into a burst of catch-up reads.
//!
//! # Hand-off
//!
//! Measurements go into a bounded [`SampleQueue`]; a full queue drops the new
//! sample rather than blocking acquisition. Once per second a
//! [`StatusReport`] is offered on a bounded event channel; if nobody is
//! reading, reports are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::config::SamplerConfig;
use crate::device::{Measurement, SharedDevice};
use crate::errors::{DriverError, Result};
use crate::queue::SampleQueue;
use crate::stats::{CollectionStats, RateWindow, StatsHandle};

/// Longest single sleep inside the loop.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Poll period while waiting for the thread to exit.
const JOIN_POLL: Duration = Duration::from_millis(5);

// ============================================================================
// Events
// ============================================================================

/// Periodic summary published by the sampling thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub samples_per_second: f64,
    pub target_rate: f64,
    pub samples_collected: u64,
    pub errors: u64,
    pub missed_samples: u64,
    pub queue_size: usize,
}

/// Notifications from the sampling thread.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEvent {
    Status(StatusReport),
    Error(String),
    Reconnected,
    ReconnectFailed { attempts: u32 },
}

// ============================================================================
// Pacer
// ============================================================================

/// Schedule of sample targets.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    next: Duration,
}

impl Pacer {
    /// First target is `start`.
    pub fn new(interval: Duration, start: Duration) -> Self {
        Self {
            interval,
            next: start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_target(&self) -> Duration {
        self.next
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.next
    }

    /// Record that the sample for the current target was taken at `now` and
    /// move to the next target. Returns how many slots were skipped.
    pub fn complete(&mut self, now: Duration) -> u64 {
        let target = self.next;
        self.next = target + self.interval;

        let lateness = now.saturating_sub(target);
        if self.interval.is_zero() || lateness < self.interval {
            return 0;
        }
        let missed = (lateness.as_nanos() / self.interval.as_nanos()) as u64;
        self.next = now + self.interval;
        missed
    }
}

// ============================================================================
// Sampling Loop
// ============================================================================

/// State owned by the sampling thread.
struct SamplingLoop {
    device: SharedDevice,
    clock: Arc<dyn Clock>,
    queue: Arc<SampleQueue>,
    stats: StatsHandle,
    events: mpsc::Sender<SamplerEvent>,
    stop: Arc<AtomicBool>,
    config: SamplerConfig,
    pacer: Pacer,
    window: RateWindow,
    last_stats: Duration,
    dropped_since_report: u64,
}

impl SamplingLoop {
    fn new(
        device: SharedDevice,
        clock: Arc<dyn Clock>,
        queue: Arc<SampleQueue>,
        stats: StatsHandle,
        events: mpsc::Sender<SamplerEvent>,
        stop: Arc<AtomicBool>,
        config: SamplerConfig,
    ) -> Self {
        let now = clock.now();
        Self {
            pacer: Pacer::new(config.interval(), now),
            window: RateWindow::new(Duration::from_secs(1)),
            last_stats: now,
            dropped_since_report: 0,
            device,
            clock,
            queue,
            stats,
            events,
            stop,
            config,
        }
    }

    fn run(mut self) {
        debug!("sampling loop started");
        while !self.stop.load(Ordering::Acquire) {
            self.step();
        }
        debug!("sampling loop exited");
    }

    /// One iteration: sample if due, refresh statistics if due, then sleep
    /// toward the next target for at most one slice.
    fn step(&mut self) {
        let now = self.clock.now();

        if self.pacer.is_due(now) {
            self.collect(now);
            let missed = self.pacer.complete(now);
            if missed > 0 {
                self.stats.update(|s| s.missed_samples += missed);
                warn!("missed {missed} samples due to timing");
            }
        }

        if now.saturating_sub(self.last_stats) >= self.config.stats_interval {
            self.update_statistics(now);
            self.last_stats = now;
        }

        let wait = self
            .pacer
            .next_target()
            .saturating_sub(self.clock.now())
            .min(MAX_SLEEP_SLICE);
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
    }

    fn collect(&mut self, now: Duration) {
        let reading = self.device.lock().get_measurement();
        let Some((voltage, current, power)) = reading else {
            self.handle_failure("failed to get measurement from DP100");
            return;
        };

        let measurement = Measurement::new(now, voltage, current, power);
        match self.queue.try_push(measurement) {
            Ok(()) => {
                self.window.record(now);
                self.stats.update(|s| {
                    s.samples_collected += 1;
                    s.last_sample_time = Some(now);
                });
            }
            Err(_) => {
                self.dropped_since_report += 1;
                self.stats.update(|s| {
                    s.errors += 1;
                    s.dropped_samples += 1;
                });
            }
        }
    }

    fn handle_failure(&mut self, message: &str) {
        self.stats.update(|s| s.errors += 1);
        debug!("{message}");
        self.notify(SamplerEvent::Error(message.to_string()));

        let (connected, attempts, delay) = {
            let dev = self.device.lock();
            let cfg = dev.config();
            (dev.is_connected(), cfg.reconnect_attempts, cfg.reconnect_delay)
        };
        if connected {
            return;
        }

        info!("device disconnected, attempting to reconnect");
        self.stats.update(|s| s.connected = false);
        if self.reconnect(attempts, delay) {
            info!("reconnected successfully");
            self.stats.update(|s| {
                s.reconnects += 1;
                s.connected = true;
            });
            self.notify(SamplerEvent::Reconnected);
        } else {
            error!("reconnection failed after {attempts} attempts");
            self.notify(SamplerEvent::ReconnectFailed { attempts });
        }
    }

    /// Bounded reconnect that releases the device between attempts and gives
    /// up early if the sampler is being stopped.
    fn reconnect(&mut self, attempts: u32, delay: Duration) -> bool {
        self.device.lock().disconnect();
        for attempt in 1..=attempts {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            if self.device.lock().connect() {
                return true;
            }
            debug!("reconnect attempt {attempt}/{attempts} failed");
            if attempt < attempts && !self.sleep_unless_stopped(delay) {
                return false;
            }
        }
        false
    }

    /// Sleep `total` in slices, checking the stop flag before each one.
    /// Returns `false` if the sampler was stopped meanwhile.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = self.clock.now() + total;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            let left = deadline.saturating_sub(self.clock.now());
            if left.is_zero() {
                return true;
            }
            self.clock.sleep(left.min(MAX_SLEEP_SLICE));
        }
    }

    fn update_statistics(&mut self, now: Duration) {
        let rate = self.window.rate(now);
        let connected = self.device.lock().is_connected();
        let queue_size = self.queue.len();

        let mut snapshot = CollectionStats::default();
        self.stats.update(|s| {
            s.samples_per_second = rate;
            s.connected = connected;
            s.queue_len = queue_size;
            snapshot = s.clone();
        });

        if self.dropped_since_report > 0 {
            warn!(
                "sample queue full, dropped {} samples",
                self.dropped_since_report
            );
            self.dropped_since_report = 0;
        }

        self.notify(SamplerEvent::Status(StatusReport {
            connected,
            samples_per_second: rate,
            target_rate: self.config.sampling_rate_hz as f64,
            samples_collected: snapshot.samples_collected,
            errors: snapshot.errors,
            missed_samples: snapshot.missed_samples,
            queue_size,
        }));
    }

    fn notify(&self, event: SamplerEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("event not delivered: {e}");
        }
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Runs the sampling loop for one device.
///
/// # Example
/// ```ignore
/// let device = Dp100::open_hid(DeviceConfig::default()).into_shared();
/// let mut sampler = Sampler::new(device, SamplerConfig::with_rate(50))?;
/// sampler.start()?;
/// loop {
///     for m in sampler.get_samples(100) {
///         println!("{:.3} V {:.3} A", m.voltage, m.current);
///     }
///     std::thread::sleep(std::time::Duration::from_millis(100));
/// }
/// ```
pub struct Sampler {
    device: SharedDevice,
    clock: Arc<dyn Clock>,
    config: SamplerConfig,
    queue: Arc<SampleQueue>,
    stats: StatsHandle,
    events_tx: mpsc::Sender<SamplerEvent>,
    events_rx: Option<mpsc::Receiver<SamplerEvent>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    pub fn new(device: SharedDevice, config: SamplerConfig) -> Result<Self> {
        Self::with_clock(device, config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        device: SharedDevice,
        config: SamplerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        Ok(Self {
            queue: Arc::new(SampleQueue::new(config.queue_capacity)),
            stats: StatsHandle::new(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            events_rx: Some(events_rx),
            events_tx,
            device,
            clock,
            config,
        })
    }

    /// Connect if needed, reset statistics, clear the queue and start the
    /// sampling thread. Does nothing while a previous thread is still alive,
    /// including one that outlived a timed-out `stop()`.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("data collection already running");
            return Ok(());
        }
        if let Some(finished) = self.handle.take() {
            if finished.join().is_err() {
                error!("previous sampling thread panicked");
            }
        }
        if !self.device.lock().connect() {
            error!("failed to connect to DP100");
            return Err(DriverError::NotConnected);
        }

        self.stats.reset(self.clock.now());
        self.stats.update(|s| s.connected = true);
        self.queue.clear();
        // Each run gets its own flag so a straggler never sees it cleared.
        self.stop = Arc::new(AtomicBool::new(false));

        let sampling_loop = self.make_loop();
        let handle = thread::Builder::new()
            .name("dp100-sampler".into())
            .spawn(move || sampling_loop.run())?;
        self.handle = Some(handle);

        info!(
            "started data collection at {} Hz",
            self.config.sampling_rate_hz
        );
        Ok(())
    }

    /// Signal the thread to stop and wait up to the configured timeout.
    /// The device stays connected.
    ///
    /// A thread that does not exit in time keeps its handle, so
    /// [`is_running`](Self::is_running) stays true until it finishes.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.config.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("sampling thread panicked");
            }
        } else {
            warn!(
                "sampling thread did not stop within {:?}",
                self.config.stop_timeout
            );
            self.handle = Some(handle);
        }

        let stats = self.stats.snapshot();
        let runtime = stats
            .runtime(self.clock.now())
            .unwrap_or_default()
            .as_secs_f64();
        let avg = if runtime > 0.0 {
            stats.samples_collected as f64 / runtime
        } else {
            0.0
        };
        info!(
            "stopped data collection: {} samples in {:.1}s ({:.1} avg Hz)",
            stats.samples_collected, runtime, avg
        );
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Up to `max` queued measurements, without blocking.
    pub fn get_samples(&self, max: usize) -> Vec<Measurement> {
        self.queue.drain(max)
    }

    /// Next measurement, waiting at most `timeout`.
    pub fn get_sample(&self, timeout: Duration) -> Option<Measurement> {
        self.queue.pop_timeout(timeout)
    }

    /// Copy of the current statistics.
    pub fn statistics(&self) -> CollectionStats {
        let mut stats = self.stats.snapshot();
        stats.queue_len = self.queue.len();
        stats
    }

    /// The event receiver. Only one consumer can hold it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SamplerEvent>> {
        self.events_rx.take()
    }

    pub fn queue(&self) -> Arc<SampleQueue> {
        self.queue.clone()
    }

    pub fn device(&self) -> SharedDevice {
        self.device.clone()
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn make_loop(&self) -> SamplingLoop {
        SamplingLoop::new(
            self.device.clone(),
            self.clock.clone(),
            self.queue.clone(),
            self.stats.clone(),
            self.events_tx.clone(),
            self.stop.clone(),
            self.config.clone(),
        )
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::Dp100;
    use crate::sim::SimulatedDp100;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn sim_device() -> (SimulatedDp100, SharedDevice) {
        let sim = SimulatedDp100::new();
        let device = Dp100::with_opener(sim.opener(), sim.device_config()).into_shared();
        (sim, device)
    }

    /// A sampler on a virtual clock whose loop is driven by hand.
    fn manual(config: SamplerConfig) -> (SimulatedDp100, ManualClock, Sampler, SamplingLoop) {
        let (sim, device) = sim_device();
        assert!(device.lock().connect());
        let clock = ManualClock::new();
        let sampler = Sampler::with_clock(device, config, Arc::new(clock.clone())).unwrap();
        sampler.stats.reset(clock.now());
        let lp = sampler.make_loop();
        (sim, clock, sampler, lp)
    }

    #[test]
    fn pacer_counts_slots_skipped_by_a_stall() {
        let mut pacer = Pacer::new(ms(20), ms(0));
        assert!(pacer.is_due(ms(0)));
        assert_eq!(pacer.complete(ms(0)), 0);
        assert_eq!(pacer.next_target(), ms(20));

        // Target 20 ms served at 100 ms.
        assert_eq!(pacer.complete(ms(100)), 4);
        assert_eq!(pacer.next_target(), ms(120));
    }

    #[test]
    fn pacer_tolerates_jitter_under_one_interval() {
        let mut pacer = Pacer::new(ms(20), ms(0));
        assert_eq!(pacer.complete(ms(15)), 0);
        assert_eq!(pacer.next_target(), ms(20));
        assert!(!pacer.is_due(ms(19)));
    }

    #[test]
    fn loop_accounts_missed_samples_on_clock_jump() {
        let (_sim, clock, sampler, mut lp) = manual(SamplerConfig::with_rate(50));

        lp.step();
        assert_eq!(sampler.statistics().samples_collected, 1);

        clock.set(ms(100));
        lp.step();
        let stats = sampler.statistics();
        assert_eq!(stats.samples_collected, 2);
        assert_eq!(stats.missed_samples, 4);
        assert_eq!(lp.pacer.next_target(), ms(120));
    }

    #[test]
    fn one_simulated_second_at_50_hz() {
        let (_sim, clock, sampler, mut lp) = manual(SamplerConfig::with_rate(50));

        while clock.now() < Duration::from_secs(1) {
            lp.step();
        }
        lp.update_statistics(clock.now());

        let stats = sampler.statistics();
        assert_eq!(stats.samples_collected + stats.missed_samples, 50);
        assert_eq!(stats.missed_samples, 0);
        assert_eq!(stats.samples_per_second, 50.0);
        assert_eq!(stats.errors, 0);

        let samples = sampler.get_samples(1000);
        assert_eq!(samples.len(), 50);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!((samples[0].power - 2.49).abs() < 1e-9);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (_sim, _clock, sampler, mut lp) = manual(SamplerConfig::with_rate(100));
        let queue = sampler.queue();

        while queue.dropped() == 0 {
            lp.step();
        }
        let stats = sampler.statistics();
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(stats.samples_collected, 1000);
        assert_eq!(stats.dropped_samples, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn status_reports_are_published_each_second() {
        let (_sim, clock, mut sampler, mut lp) = manual(SamplerConfig::with_rate(10));
        let mut events = sampler.take_events().unwrap();

        while clock.now() <= Duration::from_secs(1) {
            lp.step();
        }
        let mut report = None;
        while let Ok(ev) = events.try_recv() {
            if let SamplerEvent::Status(r) = ev {
                report = Some(r);
            }
        }
        let report = report.expect("status report");
        assert_eq!(report.target_rate, 10.0);
        assert!(report.connected);
        assert!(report.samples_collected >= 10);
    }

    #[test]
    fn unplug_triggers_reconnect() {
        let (sim, clock, mut sampler, mut lp) = manual(SamplerConfig::with_rate(50));
        let mut events = sampler.take_events().unwrap();

        lp.step();
        sim.unplug();
        sim.replug();
        while clock.now() < ms(40) {
            lp.step();
        }

        let stats = sampler.statistics();
        assert!(stats.errors >= 1);
        assert_eq!(stats.reconnects, 1);
        assert!(stats.connected);
        let got: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(got.contains(&SamplerEvent::Reconnected));
    }

    #[test]
    fn failed_reconnect_keeps_looping() {
        let (sim, clock, sampler, mut lp) = manual(SamplerConfig::with_rate(50));
        sim.unplug();
        while clock.now() < ms(100) {
            lp.step();
        }
        let stats = sampler.statistics();
        assert_eq!(stats.samples_collected, 0);
        assert!(stats.errors >= 5);
        assert!(!stats.connected);
        assert!(!sampler.device().lock().is_connected());
    }

    #[test]
    fn threaded_start_stop() {
        let (_sim, device) = sim_device();
        let mut sampler = Sampler::new(device.clone(), SamplerConfig::with_rate(100)).unwrap();

        sampler.start().unwrap();
        assert!(sampler.is_running());
        sampler.start().unwrap();
        thread::sleep(ms(200));
        sampler.stop();
        assert!(!sampler.is_running());

        // Stopping leaves the device connected for manual control.
        assert!(device.lock().is_connected());

        let stats = sampler.statistics();
        assert!(stats.samples_collected >= 5, "{stats:?}");
        let samples = sampler.get_samples(usize::MAX);
        assert_eq!(samples.len() as u64, stats.samples_collected);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // A second run starts from clean counters and an empty queue.
        sampler.start().unwrap();
        sampler.stop();
        assert!(sampler.statistics().samples_collected <= stats.samples_collected);
    }

    #[test]
    fn stop_interrupts_reconnect_and_restart_has_one_producer() {
        let sim = SimulatedDp100::new();
        let device_config = crate::config::DeviceConfig {
            reconnect_delay: ms(1500),
            ..sim.device_config()
        };
        let device = Dp100::with_opener(sim.opener(), device_config).into_shared();
        let config = SamplerConfig {
            stop_timeout: ms(500),
            ..SamplerConfig::with_rate(100)
        };
        let mut sampler = Sampler::new(device, config).unwrap();

        sampler.start().unwrap();
        thread::sleep(ms(50));
        sim.unplug();
        // The loop is now waiting between reconnect attempts.
        thread::sleep(ms(100));

        let began = Instant::now();
        sampler.stop();
        assert!(began.elapsed() < ms(500), "stop took {:?}", began.elapsed());
        assert!(!sampler.is_running());

        sim.replug();
        sampler.start().unwrap();
        thread::sleep(ms(300));
        sampler.stop();

        let stats = sampler.statistics();
        assert_eq!(stats.reconnects, 0);
        assert!(stats.samples_collected <= 40, "{stats:?}");
        let drained = sampler.get_samples(usize::MAX);
        assert_eq!(drained.len() as u64, stats.samples_collected);
        assert!(drained.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn timed_out_stop_blocks_restart_until_thread_exits() {
        let sim = SimulatedDp100::new();
        let device_config = crate::config::DeviceConfig {
            inter_frame_delay: ms(300),
            ..sim.device_config()
        };
        let device = Dp100::with_opener(sim.opener(), device_config).into_shared();
        let config = SamplerConfig {
            stop_timeout: ms(50),
            ..SamplerConfig::with_rate(10)
        };
        let mut sampler = Sampler::new(device, config).unwrap();

        sampler.start().unwrap();
        thread::sleep(ms(20));

        // The thread is inside a 300 ms exchange and cannot exit in time.
        sampler.stop();
        assert!(sampler.is_running());

        let opens = sim.open_count();
        sampler.start().unwrap();
        assert_eq!(sim.open_count(), opens);

        let deadline = Instant::now() + Duration::from_secs(3);
        while sampler.is_running() && Instant::now() < deadline {
            thread::sleep(ms(10));
        }
        assert!(!sampler.is_running());
        sampler.stop();
        assert!(!sampler.is_running());
    }

    #[test]
    fn reconnect_wait_honours_stop_flag() {
        let (sim, _clock, sampler, mut lp) = manual(SamplerConfig::with_rate(50));
        sim.unplug();
        sampler.stop.store(true, Ordering::Release);
        assert!(!lp.reconnect(5, Duration::from_secs(60)));
        assert!(!lp.sleep_unless_stopped(Duration::from_secs(60)));
    }

    #[test]
    fn start_fails_without_device() {
        let (sim, device) = sim_device();
        sim.unplug();
        let mut sampler = Sampler::new(device, SamplerConfig::default()).unwrap();
        assert!(matches!(sampler.start(), Err(DriverError::NotConnected)));
        assert!(!sampler.is_running());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (_sim, device) = sim_device();
        assert!(matches!(
            Sampler::new(device, SamplerConfig::with_rate(0)),
            Err(DriverError::InvalidConfig(_))
        ));
    }
}
