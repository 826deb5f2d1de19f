use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use log::{debug, trace, warn};

use crate::errors::TransportError;
use crate::frame::{Frame, REPORT_SIZE};

/// Alientek USB vendor ID.
pub const VENDOR_ID: u16 = 0x2E3C;
/// DP100 product ID.
pub const PRODUCT_ID: u16 = 0xAF01;

/// Time the supply needs between our report and its reply.
pub const DEFAULT_INTER_FRAME_DELAY: Duration = Duration::from_millis(5);

// ============================================================================
// Link Abstraction
// ============================================================================

/// One open HID interface, moving whole reports.
pub trait HidLink: Send {
    /// Write a full report. Returns the number of bytes accepted.
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError>;

    /// Non-blocking read of one report. `Ok(0)` means nothing was waiting.
    fn read_report(&mut self, buf: &mut [u8; REPORT_SIZE]) -> Result<usize, TransportError>;

    /// Release the handle.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Opens a link to the supply.
pub trait LinkOpener: Send {
    fn open(&mut self) -> Result<Box<dyn HidLink>, TransportError>;
}

// ============================================================================
// hidapi Backend
// ============================================================================

/// Opens the first HID device matching a vendor/product pair.
#[derive(Debug, Clone)]
pub struct HidOpener {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for HidOpener {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
        }
    }
}

impl LinkOpener for HidOpener {
    fn open(&mut self) -> Result<Box<dyn HidLink>, TransportError> {
        let api = HidApi::new_without_enumerate()
            .map_err(|e| TransportError::Open(format!("hidapi init failed: {e}")))?;
        let device = api.open(self.vendor_id, self.product_id).map_err(|e| {
            TransportError::Open(format!(
                "{:04X}:{:04X}: {e}",
                self.vendor_id, self.product_id
            ))
        })?;
        device
            .set_blocking_mode(false)
            .map_err(|e| TransportError::Open(format!("set non-blocking failed: {e}")))?;
        debug!(
            "opened HID device {:04X}:{:04X}",
            self.vendor_id, self.product_id
        );
        Ok(Box::new(HidapiLink { device }))
    }
}

struct HidapiLink {
    device: HidDevice,
}

impl HidLink for HidapiLink {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        // Sent verbatim; the direction byte sits where hidapi expects a
        // report ID, which is how the supply's firmware reads it.
        self.device
            .write(report)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn read_report(&mut self, buf: &mut [u8; REPORT_SIZE]) -> Result<usize, TransportError> {
        self.device
            .read(buf)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

// ============================================================================
// Session
// ============================================================================

/// Holds at most one open link and performs frame exchanges over it.
pub struct Session {
    link: Option<Box<dyn HidLink>>,
    inter_frame_delay: Duration,
}

impl Session {
    pub fn new(inter_frame_delay: Duration) -> Self {
        Self {
            link: None,
            inter_frame_delay,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Install a freshly opened link, closing any previous one.
    pub fn attach(&mut self, link: Box<dyn HidLink>) {
        self.detach();
        self.link = Some(link);
    }

    /// Drop the link. Close errors are logged and otherwise ignored.
    pub fn detach(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close() {
                debug!("ignoring HID close error: {e}");
            }
        }
    }

    /// Write one frame, wait for the supply, read one report back.
    ///
    /// An I/O failure detaches the link: the handle is assumed dead (most
    /// often an unplug), so the connection reads as closed afterwards.
    pub fn exchange(&mut self, frame: &Frame) -> Result<Vec<u8>, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let report = frame
            .to_report()
            .ok_or_else(|| TransportError::Io(format!("{}-byte frame exceeds report", frame.len())))?;

        trace!("tx {:02X?}", frame.as_bytes());
        let result = Self::transact(link.as_mut(), &report, self.inter_frame_delay);
        if let Err(TransportError::Io(ref e)) = result {
            warn!("HID exchange failed, dropping handle: {e}");
            self.detach();
        }
        result
    }

    fn transact(
        link: &mut dyn HidLink,
        report: &[u8; REPORT_SIZE],
        delay: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        link.write_report(report)?;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut buf = [0u8; REPORT_SIZE];
        let n = link.read_report(&mut buf)?;
        if n == 0 {
            return Err(TransportError::NoResponse);
        }
        trace!("rx {:02X?}", &buf[..n.min(16)]);
        Ok(buf[..n].to_vec())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(DEFAULT_INTER_FRAME_DELAY)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OP_BASICINFO;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        written: Vec<[u8; REPORT_SIZE]>,
        replies: Vec<Result<Vec<u8>, TransportError>>,
        fail_write: bool,
        closed: bool,
    }

    struct ScriptedLink(Arc<Mutex<Script>>);

    impl HidLink for ScriptedLink {
        fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<usize, TransportError> {
            let mut s = self.0.lock().unwrap();
            if s.fail_write {
                return Err(TransportError::Io("unplugged".into()));
            }
            s.written.push(*report);
            Ok(REPORT_SIZE)
        }

        fn read_report(&mut self, buf: &mut [u8; REPORT_SIZE]) -> Result<usize, TransportError> {
            let mut s = self.0.lock().unwrap();
            if s.replies.is_empty() {
                return Ok(0);
            }
            let reply = s.replies.remove(0)?;
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            self.0.lock().unwrap().closed = true;
            Err(TransportError::Io("close failed".into()))
        }
    }

    fn session_with(script: &Arc<Mutex<Script>>) -> Session {
        let mut session = Session::new(Duration::ZERO);
        session.attach(Box::new(ScriptedLink(script.clone())));
        session
    }

    #[test]
    fn exchange_without_link_is_not_connected() {
        let mut session = Session::new(Duration::ZERO);
        let err = session.exchange(&Frame::encode(OP_BASICINFO, &[])).unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }

    #[test]
    fn exchange_writes_padded_report() {
        let script = Arc::new(Mutex::new(Script {
            replies: vec![Ok(vec![0xFA; REPORT_SIZE])],
            ..Default::default()
        }));
        let mut session = session_with(&script);
        let frame = Frame::encode(OP_BASICINFO, &[]);

        let reply = session.exchange(&frame).unwrap();
        assert_eq!(reply.len(), REPORT_SIZE);

        let s = script.lock().unwrap();
        assert_eq!(s.written.len(), 1);
        assert_eq!(&s.written[0][..frame.len()], frame.as_bytes());
        assert!(s.written[0][frame.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_read_is_no_response_and_keeps_link() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut session = session_with(&script);
        let err = session.exchange(&Frame::encode(OP_BASICINFO, &[])).unwrap_err();
        assert_eq!(err, TransportError::NoResponse);
        assert!(session.is_open());
    }

    #[test]
    fn io_error_detaches_and_swallows_close_error() {
        let script = Arc::new(Mutex::new(Script {
            fail_write: true,
            ..Default::default()
        }));
        let mut session = session_with(&script);
        let err = session.exchange(&Frame::encode(OP_BASICINFO, &[])).unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(!session.is_open());
        assert!(script.lock().unwrap().closed);
    }
}
