use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("{field} {value} out of range [{min}, {max}]")]
    Bounds {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("sample queue full, measurement dropped")]
    QueueFull,
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("device not connected")]
    NotConnected,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no HID handle open")]
    NotConnected,
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("hid io failed: {0}")]
    Io(String),
    #[error("device returned no data")]
    NoResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame ({len} bytes)")]
    MalformedFrame { len: usize },
    #[error("unexpected direction byte {0:#04X}")]
    BadDirection(u8),
    #[error("CRC mismatch (expected {expected:#06X}, got {actual:#06X})")]
    BadCrc { expected: u16, actual: u16 },
}

pub type Result<T> = std::result::Result<T, DriverError>;
