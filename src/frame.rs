//! DP100 binary frame codec.
//!
//! Every exchange with the supply is a single frame carried in a 64-byte HID
//! report:
//!
//! ```text
//! [direction][opcode][0x00][len][payload; len][crc lo][crc hi]
//! ```
//!
//! The CRC is CRC-16/MODBUS (poly 0x8005 reflected, init 0xFFFF, no final
//! XOR) over every byte in front of it.
//!
//! Responses are parsed by fixed byte position. The device pads replies to the
//! full report size, so the parser works on the raw report and only needs the
//! header to be present.

use crc::{Crc, CRC_16_MODBUS};

use crate::errors::FrameError;

// ============================================================================
// Constants
// ============================================================================

/// Direction byte for host-to-device frames.
pub const DIR_HOST_TO_DEVICE: u8 = 0xFB;
/// Direction byte for device-to-host frames.
pub const DIR_DEVICE_TO_HOST: u8 = 0xFA;

/// Live readings (input/output voltage, output current, temperatures).
pub const OP_BASICINFO: u8 = 0x30;
/// Setpoint group access. First payload byte selects read or modify.
pub const OP_BASICSET: u8 = 0x35;

/// BASICSET sub-flag: write the setpoint tuple.
pub const SET_MODIFY: u8 = 0x20;
/// BASICSET sub-flag: read back the active setpoints.
pub const SET_READ: u8 = 0x80;

/// Size of a HID report in both directions.
pub const REPORT_SIZE: usize = 64;

/// Shortest response the parser accepts.
pub const MIN_FRAME_LEN: usize = 10;

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 2;

/// Temperature reported when the reply is too short to carry one.
pub const DEFAULT_TEMPERATURE_C: f64 = 25.0;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16 as used by the DP100 framing.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

// ============================================================================
// Outbound frames
// ============================================================================

/// An encoded frame, header through CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Build a host-to-device frame.
    ///
    /// The length field is a single byte, so payloads longer than 255 bytes
    /// are cut to 255.
    pub fn encode(opcode: u8, payload: &[u8]) -> Self {
        Self::with_direction(DIR_HOST_TO_DEVICE, opcode, payload)
    }

    /// Build a device-to-host frame. Used by the simulated supply.
    pub fn response(opcode: u8, payload: &[u8]) -> Self {
        Self::with_direction(DIR_DEVICE_TO_HOST, opcode, payload)
    }

    fn with_direction(direction: u8, opcode: u8, payload: &[u8]) -> Self {
        let payload = &payload[..payload.len().min(u8::MAX as usize)];
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        bytes.extend_from_slice(&[direction, opcode, 0x00, payload.len() as u8]);
        bytes.extend_from_slice(payload);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - CRC_LEN]
    }

    /// CRC field as transmitted (low byte first on the wire).
    pub fn crc(&self) -> u16 {
        let n = self.bytes.len();
        u16::from_le_bytes([self.bytes[n - 2], self.bytes[n - 1]])
    }

    /// Left-justify the frame into a zero padded report.
    ///
    /// Returns `None` if the frame does not fit in one report.
    pub fn to_report(&self) -> Option<[u8; REPORT_SIZE]> {
        if self.bytes.len() > REPORT_SIZE {
            return None;
        }
        let mut report = [0u8; REPORT_SIZE];
        report[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(report)
    }
}

/// Payload for a BASICSET write. Voltage and current in mV/mA.
pub fn set_payload(output: bool, vset_mv: u16, iset_ma: u16, ovp_mv: u16, ocp_ma: u16) -> [u8; 10] {
    let [v_lo, v_hi] = vset_mv.to_le_bytes();
    let [i_lo, i_hi] = iset_ma.to_le_bytes();
    let [ovp_lo, ovp_hi] = ovp_mv.to_le_bytes();
    let [ocp_lo, ocp_hi] = ocp_ma.to_le_bytes();
    [
        SET_MODIFY,
        u8::from(output),
        v_lo,
        v_hi,
        i_lo,
        i_hi,
        ovp_lo,
        ovp_hi,
        ocp_lo,
        ocp_hi,
    ]
}

// ============================================================================
// Inbound frames
// ============================================================================

/// A device response that passed header checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    raw: Vec<u8>,
    crc_ok: bool,
}

impl ParsedFrame {
    pub fn opcode(&self) -> u8 {
        self.raw[1]
    }

    /// Payload as declared by the length byte, clipped to what was received.
    pub fn payload(&self) -> &[u8] {
        let declared = self.raw[3] as usize;
        let end = (HEADER_LEN + declared).min(self.raw.len());
        &self.raw[HEADER_LEN..end]
    }

    /// Whether the CRC after the declared payload matches.
    pub fn crc_ok(&self) -> bool {
        self.crc_ok
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Little-endian u16 at an absolute report offset, if present.
    fn u16_at(&self, offset: usize) -> Option<u16> {
        let lo = *self.raw.get(offset)?;
        let hi = *self.raw.get(offset + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }
}

/// Parse a device response.
///
/// Only the header is checked. A CRC mismatch is recorded in
/// [`ParsedFrame::crc_ok`] but does not fail the decode; use
/// [`decode_strict`] to reject it.
pub fn decode(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::MalformedFrame { len: bytes.len() });
    }
    if bytes[0] != DIR_DEVICE_TO_HOST {
        return Err(FrameError::BadDirection(bytes[0]));
    }
    let crc_ok = check_crc(bytes).is_ok();
    Ok(ParsedFrame {
        raw: bytes.to_vec(),
        crc_ok,
    })
}

/// Like [`decode`], but a bad or missing CRC is an error.
pub fn decode_strict(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
    let frame = decode(bytes)?;
    check_crc(bytes)?;
    Ok(frame)
}

fn check_crc(bytes: &[u8]) -> Result<(), FrameError> {
    let body_len = HEADER_LEN + bytes[3] as usize;
    if body_len + CRC_LEN > bytes.len() {
        return Err(FrameError::MalformedFrame { len: bytes.len() });
    }
    let expected = crc16(&bytes[..body_len]);
    let actual = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
    if expected != actual {
        return Err(FrameError::BadCrc { expected, actual });
    }
    Ok(())
}

// ============================================================================
// Response layouts
// ============================================================================

/// Byte layout used to read responses.
///
/// Two offset tables for the setpoint read-back exist in the wild. Only the
/// one where the read-back mirrors the write payload is implemented; a new
/// variant must be added here (and selected explicitly) before another is
/// used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseLayout {
    /// BASICINFO: vout @6, iout @8, temperature @14.
    /// BASICSET read-back: output @5, vset @6, iset @8.
    #[default]
    V1,
}

/// Live readings from a BASICINFO response, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInfo {
    pub voltage_out_mv: u16,
    pub current_out_ma: u16,
    /// Tenths of a degree Celsius; `None` if the reply was too short.
    pub temperature_dc: Option<u16>,
}

impl BasicInfo {
    pub fn voltage_out(&self) -> f64 {
        self.voltage_out_mv as f64 / 1000.0
    }

    pub fn current_out(&self) -> f64 {
        self.current_out_ma as f64 / 1000.0
    }

    pub fn temperature(&self) -> f64 {
        self.temperature_dc
            .map(|t| t as f64 / 10.0)
            .unwrap_or(DEFAULT_TEMPERATURE_C)
    }
}

/// Active setpoints from a BASICSET read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointReadback {
    pub output_enabled: bool,
    pub voltage_set_mv: u16,
    pub current_set_ma: u16,
}

impl ResponseLayout {
    pub fn basic_info(self, frame: &ParsedFrame) -> Option<BasicInfo> {
        match self {
            ResponseLayout::V1 => Some(BasicInfo {
                voltage_out_mv: frame.u16_at(6)?,
                current_out_ma: frame.u16_at(8)?,
                temperature_dc: frame.u16_at(14),
            }),
        }
    }

    pub fn setpoints(self, frame: &ParsedFrame) -> Option<SetpointReadback> {
        match self {
            ResponseLayout::V1 => Some(SetpointReadback {
                output_enabled: frame.raw.get(5)? & 0x01 == 0x01,
                voltage_set_mv: frame.u16_at(6)?,
                current_set_ma: frame.u16_at(8)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-at-a-time CRC-16 (reflected poly 0x8005 -> 0xA001).
    fn reference_crc(bytes: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &byte in bytes {
            crc ^= byte as u16;
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn crc_matches_reference_for_all_payload_lengths() {
        for len in 0..=60usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 37 + len) as u8).collect();
            let frame = Frame::response(OP_BASICINFO, &payload);

            let body = &frame.as_bytes()[..4 + len];
            assert_eq!(frame.crc(), reference_crc(body), "len={len}");

            let mut wire = frame.as_bytes().to_vec();
            wire.resize(wire.len().max(MIN_FRAME_LEN), 0);
            let parsed = decode_strict(&wire).expect("valid frame");
            assert_eq!(parsed.opcode(), OP_BASICINFO);
            assert_eq!(parsed.payload(), payload.as_slice());
            assert!(parsed.crc_ok());
        }
    }

    #[test]
    fn known_vector() {
        // "123456789" check value for CRC-16/MODBUS.
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(reference_crc(b"123456789"), 0x4B37);
    }

    #[test]
    fn encode_layout() {
        let frame = Frame::encode(OP_BASICSET, &[SET_READ]);
        let bytes = frame.as_bytes();
        assert_eq!(&bytes[..5], &[DIR_HOST_TO_DEVICE, OP_BASICSET, 0x00, 1, SET_READ]);
        assert_eq!(bytes.len(), 7);
        let crc = crc16(&bytes[..5]);
        assert_eq!(bytes[5], (crc & 0xFF) as u8);
        assert_eq!(bytes[6], (crc >> 8) as u8);
    }

    #[test]
    fn payload_length_is_one_byte() {
        let payload = vec![0xAA; 300];
        let frame = Frame::encode(OP_BASICINFO, &payload);
        assert_eq!(frame.as_bytes()[3], 255);
        assert_eq!(frame.payload().len(), 255);
        assert!(frame.to_report().is_none());
    }

    #[test]
    fn report_is_zero_padded() {
        let frame = Frame::encode(OP_BASICINFO, &[]);
        let report = frame.to_report().expect("fits");
        assert_eq!(&report[..frame.len()], frame.as_bytes());
        assert!(report[frame.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn short_response_is_malformed() {
        let err = decode(&[DIR_DEVICE_TO_HOST, OP_BASICINFO, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FrameError::MalformedFrame { len: 9 });
    }

    #[test]
    fn host_frame_is_bad_direction() {
        let mut wire = Frame::encode(OP_BASICINFO, &[0; 8]).as_bytes().to_vec();
        wire.resize(REPORT_SIZE, 0);
        assert_eq!(decode(&wire).unwrap_err(), FrameError::BadDirection(DIR_HOST_TO_DEVICE));
    }

    #[test]
    fn lenient_decode_keeps_bad_crc_frames() {
        let mut wire = Frame::response(OP_BASICINFO, &[1, 2, 3, 4, 5, 6]).as_bytes().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        wire.resize(REPORT_SIZE, 0);

        let parsed = decode(&wire).expect("header is fine");
        assert!(!parsed.crc_ok());
        assert!(matches!(decode_strict(&wire), Err(FrameError::BadCrc { .. })));
    }

    #[test]
    fn basic_info_offsets() {
        // vin, vout, iout, vo_max, temp1, temp2
        let mut payload = Vec::new();
        for word in [20_000u16, 4_980, 500, 30_000, 0, 312] {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        let mut wire = Frame::response(OP_BASICINFO, &payload).as_bytes().to_vec();
        wire.resize(REPORT_SIZE, 0);
        let parsed = decode(&wire).unwrap();

        let info = ResponseLayout::V1.basic_info(&parsed).unwrap();
        assert_eq!(info.voltage_out_mv, 4_980);
        assert_eq!(info.current_out_ma, 500);
        assert!((info.temperature() - 31.2).abs() < 1e-9);
    }

    #[test]
    fn temperature_defaults_when_missing() {
        let wire = [DIR_DEVICE_TO_HOST, OP_BASICINFO, 0, 6, 0, 0, 0x74, 0x13, 0xF4, 0x01];
        let parsed = decode(&wire).unwrap();
        let info = ResponseLayout::V1.basic_info(&parsed).unwrap();
        assert_eq!(info.voltage_out_mv, 4_980);
        assert_eq!(info.temperature_dc, None);
        assert_eq!(info.temperature(), DEFAULT_TEMPERATURE_C);
    }

    #[test]
    fn setpoint_readback_mirrors_write_payload() {
        let payload = set_payload(true, 5_000, 1_000, 30_500, 5_050);
        let mut wire = Frame::response(OP_BASICSET, &payload).as_bytes().to_vec();
        wire.resize(REPORT_SIZE, 0);
        let parsed = decode(&wire).unwrap();

        let sp = ResponseLayout::V1.setpoints(&parsed).unwrap();
        assert!(sp.output_enabled);
        assert_eq!(sp.voltage_set_mv, 5_000);
        assert_eq!(sp.current_set_ma, 1_000);
    }

    #[test]
    fn raw_offsets_one_to_six_misread_the_readback() {
        // Output off, 5 V / 1 A. Offsets 1..6 of the report land on the
        // header, not on the setpoints.
        let payload = set_payload(false, 5_000, 1_000, 30_500, 5_050);
        let mut wire = Frame::response(OP_BASICSET, &payload).as_bytes().to_vec();
        wire.resize(REPORT_SIZE, 0);
        let parsed = decode(&wire).unwrap();
        let raw = parsed.raw();

        assert_eq!(raw[1] & 0x01, 0x01, "opcode 0x35 reads as output on");
        assert_eq!(u16::from_le_bytes([raw[2], raw[3]]), 0x0A00);
        assert_eq!(u16::from_le_bytes([raw[4], raw[5]]), u16::from_le_bytes([SET_MODIFY, 0]));

        let sp = ResponseLayout::V1.setpoints(&parsed).unwrap();
        assert!(!sp.output_enabled);
        assert_eq!(sp.voltage_set_mv, 5_000);
        assert_eq!(sp.current_set_ma, 1_000);
    }
}
