//! Alientek DP100 USB-HID driver with a paced sampling pipeline.
//!
//! The supply is a 30 V / 5 A bench unit that speaks a small framed protocol
//! over 64-byte HID reports. This crate provides:
//!
//! - [`Dp100`]: connect, read live output and settings, change setpoints.
//! - [`Sampler`]: a background thread that polls the supply at a fixed rate
//!   into a bounded queue and publishes once-per-second status reports.
//! - [`sim::SimulatedDp100`]: an in-process supply for tests and demos.
//!
//! # Timing
//!
//! Measurements are stamped with the sampling clock at the moment the read
//! was issued, not when the reply arrived. The supply answers within a few
//! milliseconds, so up to 100 Hz is sustainable; missed targets are counted
//! in [`CollectionStats::missed_samples`] rather than caught up.
//!
//! # Setpoints
//!
//! The supply always takes voltage, current and output state together. The
//! driver keeps a shadow of the last confirmed values so that changing one
//! leaves the other two as they were.

pub mod clock;
pub mod config;
mod connection;
mod device;
mod errors;
pub mod frame;
pub mod logging;
mod queue;
mod sampler;
pub mod sim;
mod stats;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DeviceConfig, SamplerConfig};
pub use connection::ConnectionState;
pub use device::{
    DeviceInfo, DeviceStatus, Dp100, Measurement, SetpointShadow, SharedDevice, MAX_CURRENT,
    MAX_VOLTAGE,
};
pub use errors::*;
pub use queue::{SampleQueue, DEFAULT_QUEUE_CAPACITY};
pub use sampler::{Pacer, Sampler, SamplerEvent, StatusReport};
pub use stats::{CollectionStats, RateWindow, StatsHandle};
