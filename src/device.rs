//! DP100 device facade.
//!
//! [`Dp100`] turns frame exchanges into semantic operations: live
//! measurement, full status, and setpoint writes. It also keeps the
//! [`SetpointShadow`], the host's copy of the last confirmed setpoints.
//!
//! # Why a shadow
//!
//! The BASICSET write takes the whole setpoint tuple (output, voltage,
//! current, OVP, OCP) every time, and the fast BASICINFO read does not report
//! setpoints at all. Changing one value therefore means re-sending the other
//! two as last confirmed. The shadow is synchronised from a full status read
//! on connect and afterwards only changes when the supply answers a write.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::connection::ConnectionState;
use crate::errors::{DriverError, FrameError, Result, TransportError};
use crate::frame::{
    self, BasicInfo, Frame, ParsedFrame, ResponseLayout, SetpointReadback, OP_BASICINFO,
    OP_BASICSET, SET_READ,
};
use crate::transport::{HidOpener, LinkOpener, Session};

// ============================================================================
// Constants
// ============================================================================

pub const MAX_VOLTAGE: f64 = 30.0;
pub const MAX_CURRENT: f64 = 5.0;

/// Over-voltage protection sent with every write, in millivolts.
pub const DEFAULT_OVP_MV: u16 = 30_500;
/// Over-current protection sent with every write, in milliamps.
pub const DEFAULT_OCP_MA: u16 = 5_050;

// ============================================================================
// Data Types
// ============================================================================

/// One timestamped reading of the output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    /// Offset from the Unix epoch, from the sampling clock.
    pub timestamp: Duration,
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Watts.
    pub power: f64,
}

impl Measurement {
    /// Build a measurement. A `power` of zero is replaced by `voltage * current`.
    pub fn new(timestamp: Duration, voltage: f64, current: f64, power: f64) -> Self {
        let power = if power == 0.0 { voltage * current } else { power };
        Self {
            timestamp,
            voltage,
            current,
            power,
        }
    }

    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

/// Everything the supply reports, setpoints included.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub voltage_set: f64,
    pub current_set: f64,
    pub voltage_out: f64,
    pub current_out: f64,
    /// Derived as `voltage_out * current_out`; the supply never sends it.
    pub power_out: f64,
    pub output_enabled: bool,
    /// Degrees Celsius.
    pub temperature: f64,
}

impl DeviceStatus {
    fn from_parts(info: &BasicInfo, sp: &SetpointReadback) -> Self {
        let voltage_out = info.voltage_out();
        let current_out = info.current_out();
        Self {
            voltage_set: sp.voltage_set_mv as f64 / 1000.0,
            current_set: sp.current_set_ma as f64 / 1000.0,
            voltage_out,
            current_out,
            power_out: voltage_out * current_out,
            output_enabled: sp.output_enabled,
            temperature: info.temperature(),
        }
    }
}

/// Last setpoints the supply confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetpointShadow {
    pub voltage_set_mv: u16,
    pub current_set_ma: u16,
    pub output_enabled: bool,
}

impl Default for SetpointShadow {
    fn default() -> Self {
        Self {
            voltage_set_mv: 0,
            current_set_ma: 1000,
            output_enabled: false,
        }
    }
}

impl SetpointShadow {
    pub(crate) fn sync_from(&mut self, status: &DeviceStatus) {
        self.voltage_set_mv = to_milli(status.voltage_set);
        self.current_set_ma = to_milli(status.current_set);
        self.output_enabled = status.output_enabled;
    }

    fn write_payload(&self) -> [u8; 10] {
        frame::set_payload(
            self.output_enabled,
            self.voltage_set_mv,
            self.current_set_ma,
            DEFAULT_OVP_MV,
            DEFAULT_OCP_MA,
        )
    }
}

/// Summary for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub connected: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub shadow: SetpointShadow,
}

fn to_milli(value: f64) -> u16 {
    (value * 1000.0).round().clamp(0.0, u16::MAX as f64) as u16
}

fn check_bounds(field: &'static str, value: f64, max: f64) -> Result<()> {
    if (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(DriverError::Bounds {
            field,
            value,
            min: 0.0,
            max,
        })
    }
}

// ============================================================================
// Dp100 Driver
// ============================================================================

/// Device shared between the sampling thread and control callers.
pub type SharedDevice = Arc<Mutex<Dp100>>;

/// DP100 power supply driver.
///
/// Not safe for concurrent use on its own; share it as a [`SharedDevice`] so
/// every exchange happens under one lock.
///
/// # Example
/// ```ignore
/// let mut psu = Dp100::open_hid(DeviceConfig::default());
/// if psu.connect() {
///     psu.set_voltage(5.0)?;
///     psu.set_output(true)?;
///     println!("{:?}", psu.get_measurement());
/// }
/// ```
pub struct Dp100 {
    pub(crate) opener: Box<dyn LinkOpener>,
    pub(crate) session: Session,
    pub(crate) shadow: SetpointShadow,
    pub(crate) state: ConnectionState,
    pub(crate) config: DeviceConfig,
    layout: ResponseLayout,
}

impl Dp100 {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Driver for the real supply over hidapi. Does not connect yet.
    pub fn open_hid(config: DeviceConfig) -> Self {
        let opener = HidOpener {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
        };
        Self::with_opener(opener, config)
    }

    /// Driver over any link source, such as the simulated supply.
    pub fn with_opener(opener: impl LinkOpener + 'static, config: DeviceConfig) -> Self {
        Self {
            opener: Box::new(opener),
            session: Session::new(config.inter_frame_delay),
            shadow: SetpointShadow::default(),
            state: ConnectionState::Disconnected,
            config,
            layout: ResponseLayout::default(),
        }
    }

    /// Wrap for sharing with a sampler.
    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Live output voltage, current and derived power in one round trip.
    ///
    /// Returns `None` on any transport or parse failure.
    pub fn get_measurement(&mut self) -> Option<(f64, f64, f64)> {
        match self.read_basic_info() {
            Ok(info) => {
                let (v, i) = (info.voltage_out(), info.current_out());
                Some((v, i, v * i))
            }
            Err(e) => {
                debug!("measurement read failed: {e}");
                None
            }
        }
    }

    /// Output readings plus active setpoints. Two round trips, so keep it out
    /// of the sampling loop.
    pub fn get_full_status(&mut self) -> Option<DeviceStatus> {
        match self.read_full_status() {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("status read failed: {e}");
                None
            }
        }
    }

    /// One measurement stamped with `clock`, outside any sampling loop.
    pub fn single_measurement(&mut self, clock: &dyn Clock) -> Option<Measurement> {
        let (v, i, p) = self.get_measurement()?;
        Some(Measurement::new(clock.now(), v, i, p))
    }

    pub(crate) fn read_full_status(&mut self) -> Result<DeviceStatus> {
        let info = self.read_basic_info()?;
        let reply = self.request(OP_BASICSET, &[SET_READ])?;
        let sp = self
            .layout
            .setpoints(&reply)
            .ok_or(FrameError::MalformedFrame { len: reply.raw().len() })?;
        Ok(DeviceStatus::from_parts(&info, &sp))
    }

    fn read_basic_info(&mut self) -> Result<BasicInfo> {
        let reply = self.request(OP_BASICINFO, &[])?;
        let info = self
            .layout
            .basic_info(&reply)
            .ok_or(FrameError::MalformedFrame { len: reply.raw().len() })?;
        Ok(info)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Set the output voltage in volts, range `[0, 30]`.
    ///
    /// `Ok(true)` once the supply answers, `Ok(false)` if it did not; the
    /// shadow changes only in the first case.
    pub fn set_voltage(&mut self, volts: f64) -> Result<bool> {
        check_bounds("voltage", volts, MAX_VOLTAGE)?;
        let next = SetpointShadow {
            voltage_set_mv: to_milli(volts),
            ..self.shadow
        };
        Ok(self.write_setpoints(next))
    }

    /// Set the current limit in amps, range `[0, 5]`.
    pub fn set_current(&mut self, amps: f64) -> Result<bool> {
        check_bounds("current", amps, MAX_CURRENT)?;
        let next = SetpointShadow {
            current_set_ma: to_milli(amps),
            ..self.shadow
        };
        Ok(self.write_setpoints(next))
    }

    /// Switch the output on or off.
    pub fn set_output(&mut self, enabled: bool) -> Result<bool> {
        let next = SetpointShadow {
            output_enabled: enabled,
            ..self.shadow
        };
        Ok(self.write_setpoints(next))
    }

    fn write_setpoints(&mut self, next: SetpointShadow) -> bool {
        let payload = next.write_payload();
        match self.exchange(OP_BASICSET, &payload) {
            Ok(_) => {
                info!(
                    "setpoints confirmed: {} mV, {} mA, output {}",
                    next.voltage_set_mv,
                    next.current_set_ma,
                    if next.output_enabled { "on" } else { "off" }
                );
                self.shadow = next;
                true
            }
            Err(e) => {
                warn!("setpoint write not confirmed: {e}");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Copy of the last confirmed setpoints.
    pub fn shadow(&self) -> SetpointShadow {
        self.shadow
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            connected: self.is_connected(),
            vendor_id: self.config.vendor_id,
            product_id: self.config.product_id,
            shadow: self.shadow,
        }
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Exchange a frame and return the raw reply.
    fn exchange(&mut self, opcode: u8, payload: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let result = self.session.exchange(&Frame::encode(opcode, payload));
        if result.is_err() && !self.session.is_open() && self.state == ConnectionState::Connected {
            warn!("link lost, marking device disconnected");
            self.state = ConnectionState::Disconnected;
        }
        result
    }

    /// Exchange a frame and decode the reply header.
    fn request(&mut self, opcode: u8, payload: &[u8]) -> Result<ParsedFrame> {
        let reply = self.exchange(opcode, payload)?;
        let parsed = frame::decode(&reply)?;
        if !parsed.crc_ok() {
            debug!("reply to {opcode:#04X} has no valid CRC, using field positions");
        }
        Ok(parsed)
    }
}
