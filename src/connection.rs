use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::device::Dp100;
use crate::errors::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl Dp100 {
    /// Open the supply and verify it answers.
    ///
    /// Returns `true` straight away if already connected. Otherwise opens the
    /// link, reads the full status as a self-test and syncs the setpoint
    /// shadow from it. Any failure closes the link again.
    pub fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }

        let link = match self.opener.open() {
            Ok(link) => link,
            Err(e) => {
                warn!("failed to open DP100: {e}");
                self.disconnect();
                return false;
            }
        };
        self.session.attach(link);

        match self.read_full_status() {
            Ok(status) => {
                self.shadow.sync_from(&status);
                self.state = ConnectionState::Connected;
                debug!("self-test ok, shadow synced: {:?}", self.shadow);
                info!("connected to DP100");
                true
            }
            Err(e) => {
                warn!("DP100 self-test failed: {e}");
                self.disconnect();
                false
            }
        }
    }

    /// Close the link if open. Always leaves the device disconnected.
    pub fn disconnect(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        self.session.detach();
        self.state = ConnectionState::Disconnected;
        if was_connected {
            info!("disconnected from DP100");
        }
    }

    /// Disconnect, then try [`connect`](Self::connect) up to `max_attempts`
    /// times with `delay` between failures. Blocks for the whole sequence.
    pub fn reconnect(&mut self, max_attempts: u32, delay: Duration) -> bool {
        self.disconnect();
        for attempt in 1..=max_attempts {
            if self.connect() {
                info!("reconnected on attempt {attempt}/{max_attempts}");
                return true;
            }
            debug!("reconnect attempt {attempt}/{max_attempts} failed");
            if attempt < max_attempts && !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        error!("reconnect gave up after {max_attempts} attempts");
        false
    }

    /// [`reconnect`](Self::reconnect) using the configured policy, with the
    /// failure reported as an error.
    pub fn reconnect_checked(&mut self) -> Result<()> {
        let attempts = self.config.reconnect_attempts;
        let delay = self.config.reconnect_delay;
        if self.reconnect(attempts, delay) {
            Ok(())
        } else {
            Err(DriverError::ReconnectExhausted { attempts })
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_open()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}
