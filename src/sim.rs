//! In-process DP100 stand-in.
//!
//! Speaks the same frame protocol as the real supply, so the driver, the
//! connection logic and the sampler can be exercised without hardware. Used
//! by the unit tests and by the CLI's `--simulate` flag.

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use parking_lot::Mutex;

use crate::config::DeviceConfig;
use crate::errors::TransportError;
use crate::frame::{
    self, Frame, DIR_HOST_TO_DEVICE, OP_BASICINFO, OP_BASICSET, REPORT_SIZE, SET_MODIFY, SET_READ,
};
use crate::transport::{HidLink, LinkOpener};

/// Electrical state of the simulated supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimState {
    pub input_mv: u16,
    pub voltage_set_mv: u16,
    pub current_set_ma: u16,
    pub output_enabled: bool,
    pub voltage_out_mv: u16,
    pub current_out_ma: u16,
    /// Tenths of a degree Celsius.
    pub temperature_dc: u16,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            input_mv: 20_000,
            voltage_set_mv: 5_000,
            current_set_ma: 1_000,
            output_enabled: false,
            voltage_out_mv: 4_980,
            current_out_ma: 500,
            temperature_dc: 285,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: SimState,
    plugged_in: bool,
    silent: bool,
    /// Bumped on every unplug so stale handles stop working.
    generation: u64,
    open_count: u32,
    received: Vec<[u8; REPORT_SIZE]>,
}

/// A simulated supply. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimulatedDp100 {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimulatedDp100 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDp100 {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                plugged_in: true,
                ..Inner::default()
            })),
        }
    }

    /// Link source to hand to [`Dp100::with_opener`](crate::Dp100::with_opener).
    pub fn opener(&self) -> SimOpener {
        SimOpener { sim: self.clone() }
    }

    /// Device config with no waits, suited to the simulator.
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            inter_frame_delay: Duration::ZERO,
            reconnect_delay: Duration::ZERO,
            ..DeviceConfig::default()
        }
    }

    pub fn state(&self) -> SimState {
        self.inner.lock().state.clone()
    }

    pub fn set_state<F: FnOnce(&mut SimState)>(&self, f: F) {
        f(&mut self.inner.lock().state);
    }

    /// Stop answering frames while keeping the link up.
    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().silent = silent;
    }

    /// Pull the cable: open handles fail and new opens are refused.
    pub fn unplug(&self) {
        let mut inner = self.inner.lock();
        inner.plugged_in = false;
        inner.generation += 1;
    }

    pub fn replug(&self) {
        self.inner.lock().plugged_in = true;
    }

    pub fn open_count(&self) -> u32 {
        self.inner.lock().open_count
    }

    pub fn frames_received(&self) -> usize {
        self.inner.lock().received.len()
    }

    /// Last report the host wrote.
    pub fn last_frame(&self) -> Option<[u8; REPORT_SIZE]> {
        self.inner.lock().received.last().copied()
    }
}

/// [`LinkOpener`] for a [`SimulatedDp100`].
#[derive(Debug, Clone)]
pub struct SimOpener {
    sim: SimulatedDp100,
}

impl LinkOpener for SimOpener {
    fn open(&mut self) -> Result<Box<dyn HidLink>, TransportError> {
        let mut inner = self.sim.inner.lock();
        if !inner.plugged_in {
            return Err(TransportError::Open("simulated device unplugged".into()));
        }
        inner.open_count += 1;
        Ok(Box::new(SimLink {
            sim: self.sim.clone(),
            generation: inner.generation,
            pending: None,
        }))
    }
}

struct SimLink {
    sim: SimulatedDp100,
    generation: u64,
    pending: Option<Frame>,
}

impl SimLink {
    fn check_alive(&self, inner: &Inner) -> Result<(), TransportError> {
        if !inner.plugged_in || inner.generation != self.generation {
            return Err(TransportError::Io("simulated device unplugged".into()));
        }
        Ok(())
    }
}

impl HidLink for SimLink {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        let mut inner = self.sim.inner.lock();
        self.check_alive(&inner)?;
        inner.received.push(*report);
        self.pending = if inner.silent {
            None
        } else {
            respond(&mut inner.state, report)
        };
        Ok(REPORT_SIZE)
    }

    fn read_report(&mut self, buf: &mut [u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        let inner = self.sim.inner.lock();
        self.check_alive(&inner)?;
        match self.pending.take().and_then(|f| f.to_report()) {
            Some(report) => {
                *buf = report;
                Ok(REPORT_SIZE)
            }
            None => Ok(0),
        }
    }
}

/// Build the supply's reply to one host report, updating state on writes.
fn respond(state: &mut SimState, report: &[u8; REPORT_SIZE]) -> Option<Frame> {
    if report[0] != DIR_HOST_TO_DEVICE {
        return None;
    }
    let len = report[3] as usize;
    let body_end = 4 + len;
    if body_end + 2 > REPORT_SIZE {
        return None;
    }
    let crc = u16::from_le_bytes([report[body_end], report[body_end + 1]]);
    if crc != frame::crc16(&report[..body_end]) {
        trace!("sim: dropping frame with bad CRC");
        return None;
    }
    let payload = &report[4..body_end];

    match (report[1], payload.first().copied()) {
        (OP_BASICINFO, _) => {
            let mut out = Vec::with_capacity(12);
            for word in [
                state.input_mv,
                state.voltage_out_mv,
                state.current_out_ma,
                state.input_mv,
                state.temperature_dc,
                state.temperature_dc,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
            Some(Frame::response(OP_BASICINFO, &out))
        }
        (OP_BASICSET, Some(SET_READ)) => {
            let mut out = frame::set_payload(
                state.output_enabled,
                state.voltage_set_mv,
                state.current_set_ma,
                0,
                0,
            );
            out[0] = 0; // active preset index
            Some(Frame::response(OP_BASICSET, &out))
        }
        (OP_BASICSET, Some(SET_MODIFY)) if payload.len() >= 6 => {
            state.output_enabled = payload[1] & 0x01 == 0x01;
            state.voltage_set_mv = u16::from_le_bytes([payload[2], payload[3]]);
            state.current_set_ma = u16::from_le_bytes([payload[4], payload[5]]);
            Some(Frame::response(OP_BASICSET, &[0x01]))
        }
        _ => None,
    }
}
