//! Typed settings for the device and the sampler.
//!
//! Values are accepted as given; reading them from a file is the host
//! application's job. Durations deserialize from milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::{DriverError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::transport::{DEFAULT_INTER_FRAME_DELAY, PRODUCT_ID, VENDOR_ID};

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_SAMPLING_RATE_HZ: u32 = 50;
const MAX_SAMPLING_RATE_HZ: u32 = 100;
const DEFAULT_EVENT_CAPACITY: usize = 64;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

fn millis<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

/// How the driver reaches the supply and how hard it tries to get it back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(rename = "inter_frame_delay_ms", deserialize_with = "millis")]
    pub inter_frame_delay: Duration,
    pub reconnect_attempts: u32,
    #[serde(rename = "reconnect_delay_ms", deserialize_with = "millis")]
    pub reconnect_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            inter_frame_delay: DEFAULT_INTER_FRAME_DELAY,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Sampling loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub sampling_rate_hz: u32,
    pub queue_capacity: usize,
    pub event_capacity: usize,
    #[serde(rename = "stop_timeout_ms", deserialize_with = "millis")]
    pub stop_timeout: Duration,
    #[serde(rename = "stats_interval_ms", deserialize_with = "millis")]
    pub stats_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl SamplerConfig {
    pub fn with_rate(rate_hz: u32) -> Self {
        Self {
            sampling_rate_hz: rate_hz,
            ..Self::default()
        }
    }

    /// Period between sample targets.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.sampling_rate_hz.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SAMPLING_RATE_HZ).contains(&self.sampling_rate_hz) {
            return Err(DriverError::InvalidConfig(format!(
                "sampling rate {} Hz (must be 1-{MAX_SAMPLING_RATE_HZ} Hz)",
                self.sampling_rate_hz
            )));
        }
        if self.queue_capacity == 0 {
            return Err(DriverError::InvalidConfig("queue capacity must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(DriverError::InvalidConfig("event capacity must be at least 1".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(DriverError::InvalidConfig("stats interval must be non-zero".into()));
        }
        Ok(())
    }
}
