//! MUP1 serial framing
//!
//! MUP1 wraps each frame as `>T<data><[<]cccc` where `T` is a one-byte
//! frame type, reserved bytes inside the payload are escaped with `\`,
//! and `cccc` is a 16-bit one's-complement checksum in ASCII hex over the
//! unescaped frame. A second `<` is appended when the unescaped payload
//! has odd length, which keeps receivers able to resynchronise on the
//! trailing delimiter run.
//!
//! The receiver is a per-byte state machine. Framing errors never
//! propagate: the machine logs and resets, and bytes seen outside any
//! frame are handed to the catch-all subscriber so console output
//! interleaved with frames stays visible.

use crate::error::{Error, Result};

pub const SOF: u8 = b'>';
pub const EOF: u8 = b'<';
pub const ESC: u8 = b'\\';

/// Escape remappings applied after the `\` prefix
const ESC_NUL: u8 = b'0';
const ESC_FF: u8 = b'F';

/// Frame type tags understood by the device
pub mod tag {
    /// Bytes that arrived outside any MUP1 frame
    pub const NON_MUP1: u8 = 0;
    pub const ANNOUNCE: u8 = b'A';
    pub const COAP: u8 = b'C';
    pub const PING: u8 = b'P';
    pub const TRACE: u8 = b'T';
    /// Host-to-device ping request; the device pongs with [`PING`]
    pub const PING_REQ: u8 = b'p';
}

const MAX_PAYLOAD: usize = 1024;
const MAX_RAW: usize = 10 * 1024;

/// One's-complement 16-bit checksum over big-endian words
///
/// Odd-length input is padded with a zero byte; the carry is folded twice
/// before complementing.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let hi = u32::from(chunk[0]) << 8;
        let lo = u32::from(chunk.get(1).copied().unwrap_or(0));
        sum += hi | lo;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum = (sum & 0xFFFF) + (sum >> 16);
    !(sum as u16)
}

/// Build the on-wire bytes for one frame
pub fn encode_frame(typ: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Mup1(format!(
            "payload too large: {} > {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }

    let two_eofs = payload.len() % 2 == 1;

    // Checksum covers the unescaped frame including the trailing EOFs
    let mut wrapper = Vec::with_capacity(payload.len() + 4);
    wrapper.push(SOF);
    wrapper.push(typ);
    wrapper.extend_from_slice(payload);
    wrapper.push(EOF);
    if two_eofs {
        wrapper.push(EOF);
    }
    let sum = checksum(&wrapper);

    let mut out = Vec::with_capacity(wrapper.len() + payload.len() + 4);
    out.push(SOF);
    out.push(typ);
    for &b in payload {
        match b {
            SOF | EOF | ESC => {
                out.push(ESC);
                out.push(b);
            }
            0x00 => {
                out.push(ESC);
                out.push(ESC_NUL);
            }
            0xFF => {
                out.push(ESC);
                out.push(ESC_FF);
            }
            _ => out.push(b),
        }
    }
    out.push(EOF);
    if two_eofs {
        out.push(EOF);
    }
    out.extend_from_slice(format!("{:04x}", sum).as_bytes());
    Ok(out)
}

/// Something the receive machine produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mup1Event {
    /// A checksum-verified frame
    Frame { typ: u8, payload: Vec<u8> },
    /// Bytes that are not part of any frame
    Passthrough(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Init,
    /// SOF seen, waiting for the type byte
    Sof,
    Data,
    Esc,
    /// First EOF seen with odd payload length, a second EOF must follow
    Eof2,
    /// Collecting the four checksum characters
    Chk(u8),
}

/// MUP1 receive state machine plus transmit-side escaping
#[derive(Debug)]
pub struct Mup1Framer {
    enabled: bool,
    state: RxState,
    typ: u8,
    payload: Vec<u8>,
    /// Unescaped wrapper bytes recorded for the checksum comparison
    wrapper: Vec<u8>,
    chk: [u8; 4],
    /// Bytes accumulated outside any frame
    raw: Vec<u8>,
}

impl Default for Mup1Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mup1Framer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            state: RxState::Init,
            typ: 0,
            payload: Vec::new(),
            wrapper: Vec::new(),
            chk: [0; 4],
            raw: Vec::new(),
        }
    }

    /// A disabled framer passes every byte through unchanged
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Feed received bytes, returning every completed event
    pub fn feed(&mut self, data: &[u8]) -> Vec<Mup1Event> {
        if !self.enabled {
            if data.is_empty() {
                return Vec::new();
            }
            return vec![Mup1Event::Passthrough(data.to_vec())];
        }

        let mut events = Vec::new();
        for &b in data {
            if let Some(ev) = self.push(b) {
                events.push(ev);
            }
        }
        events
    }

    /// Reset the machine after an inter-byte timeout
    ///
    /// Any bytes collected outside a frame are surfaced so console text is
    /// not lost; a partially received frame is dropped.
    pub fn on_timeout(&mut self) -> Option<Mup1Event> {
        if self.state != RxState::Init {
            log::debug!("MUP1 rx timeout in {:?}, resetting", self.state);
        }
        self.reset();
        self.take_raw()
    }

    /// True while the machine is inside a frame
    pub fn mid_frame(&self) -> bool {
        self.state != RxState::Init
    }

    fn take_raw(&mut self) -> Option<Mup1Event> {
        if self.raw.is_empty() {
            None
        } else {
            Some(Mup1Event::Passthrough(std::mem::take(&mut self.raw)))
        }
    }

    fn reset(&mut self) {
        self.state = RxState::Init;
        self.payload.clear();
        self.wrapper.clear();
    }

    fn push(&mut self, b: u8) -> Option<Mup1Event> {
        match self.state {
            RxState::Init => {
                if b == SOF {
                    self.reset();
                    self.wrapper.push(SOF);
                    self.state = RxState::Sof;
                    return self.take_raw();
                }
                self.raw.push(b);
                if self.raw.len() >= MAX_RAW {
                    return self.take_raw();
                }
                None
            }
            RxState::Sof => {
                self.typ = b;
                self.wrapper.push(b);
                self.state = RxState::Data;
                None
            }
            RxState::Data => match b {
                ESC => {
                    self.state = RxState::Esc;
                    None
                }
                EOF => {
                    self.wrapper.push(EOF);
                    self.state = if self.payload.len() % 2 == 1 {
                        RxState::Eof2
                    } else {
                        RxState::Chk(0)
                    };
                    None
                }
                SOF | 0x00 | 0xFF => {
                    log::debug!("MUP1: unescaped {:#04x} inside frame", b);
                    self.reset();
                    None
                }
                _ => {
                    self.accept_payload_byte(b);
                    None
                }
            },
            RxState::Esc => {
                let unescaped = match b {
                    SOF | EOF | ESC => Some(b),
                    ESC_NUL => Some(0x00),
                    ESC_FF => Some(0xFF),
                    _ => None,
                };
                match unescaped {
                    Some(u) => {
                        self.accept_payload_byte(u);
                        if self.state != RxState::Init {
                            self.state = RxState::Data;
                        }
                    }
                    None => {
                        log::debug!("MUP1: invalid escape {:#04x}", b);
                        self.reset();
                    }
                }
                None
            }
            RxState::Eof2 => {
                if b == EOF {
                    self.wrapper.push(EOF);
                    self.state = RxState::Chk(0);
                } else {
                    log::debug!("MUP1: expected second EOF, got {:#04x}", b);
                    self.reset();
                }
                None
            }
            RxState::Chk(n) => {
                self.chk[n as usize] = b;
                if n < 3 {
                    self.state = RxState::Chk(n + 1);
                    return None;
                }
                let event = self.finish_frame();
                self.reset();
                event
            }
        }
    }

    fn accept_payload_byte(&mut self, b: u8) {
        if self.payload.len() >= MAX_PAYLOAD {
            log::warn!("MUP1: frame exceeds {} bytes, dropping", MAX_PAYLOAD);
            self.reset();
            return;
        }
        self.payload.push(b);
        self.wrapper.push(b);
    }

    fn finish_frame(&mut self) -> Option<Mup1Event> {
        let text = std::str::from_utf8(&self.chk).ok()?;
        let received = match u16::from_str_radix(text, 16) {
            Ok(v) => v,
            Err(_) => {
                log::warn!("MUP1: malformed checksum field {:?}", text);
                return None;
            }
        };
        let expected = checksum(&self.wrapper);
        if received != expected {
            log::warn!(
                "MUP1: checksum mismatch, got {:04x} expected {:04x}",
                received,
                expected
            );
            return None;
        }
        Some(Mup1Event::Frame {
            typ: self.typ,
            payload: std::mem::take(&mut self.payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_escapes_reserved_bytes() {
        let frame = encode_frame(tag::COAP, &[0x3E, 0x00, 0xFF]).unwrap();
        // ">C" + escaped payload + two EOFs (odd payload) + checksum
        assert_eq!(
            &frame[..10],
            &[0x3E, 0x43, 0x5C, 0x3E, 0x5C, 0x30, 0x5C, 0x46, 0x3C, 0x3C]
        );
        assert_eq!(&frame[10..], b"487f");
    }

    #[test]
    fn test_checksum_folds_and_complements() {
        let wrapper = [0x3E, 0x43, 0x3E, 0x00, 0xFF, 0x3C, 0x3C];
        assert_eq!(checksum(&wrapper), 0x487F);
        // even-length input takes the no-padding path
        assert_eq!(checksum(&[0x00, 0x00]), 0xFFFF);
    }

    #[test]
    fn test_rx_roundtrip() {
        let frame = encode_frame(tag::COAP, &[0x3E, 0x00, 0xFF]).unwrap();
        let mut framer = Mup1Framer::new();
        let events = framer.feed(&frame);
        assert_eq!(
            events,
            vec![Mup1Event::Frame {
                typ: tag::COAP,
                payload: vec![0x3E, 0x00, 0xFF],
            }]
        );
    }

    #[test]
    fn test_rx_roundtrip_even_payload_single_eof() {
        let frame = encode_frame(tag::PING, &[0x01, 0x02]).unwrap();
        // single EOF before the checksum
        assert_eq!(frame[4], EOF);
        assert_ne!(frame[5], EOF);

        let mut framer = Mup1Framer::new();
        let events = framer.feed(&frame);
        assert_eq!(
            events,
            vec![Mup1Event::Frame {
                typ: tag::PING,
                payload: vec![0x01, 0x02],
            }]
        );
    }

    #[test]
    fn test_rx_across_split_reads() {
        let frame = encode_frame(tag::ANNOUNCE, b"VelocitySP-v1").unwrap();
        let mut framer = Mup1Framer::new();
        let mut events = Vec::new();
        for chunk in frame.chunks(3) {
            events.extend(framer.feed(chunk));
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Mup1Event::Frame { typ, .. } if typ == tag::ANNOUNCE));
    }

    #[test]
    fn test_bad_checksum_is_dropped() {
        let mut frame = encode_frame(tag::COAP, &[1, 2, 3, 4]).unwrap();
        let n = frame.len();
        frame[n - 1] = if frame[n - 1] == b'0' { b'1' } else { b'0' };
        let mut framer = Mup1Framer::new();
        assert!(framer.feed(&frame).is_empty());
        // the machine recovered and accepts the next frame
        let good = encode_frame(tag::COAP, &[5, 6]).unwrap();
        assert_eq!(framer.feed(&good).len(), 1);
    }

    #[test]
    fn test_unescaped_sof_inside_frame_resets() {
        let mut framer = Mup1Framer::new();
        // start a frame, then feed a raw SOF where payload is expected
        assert!(framer.feed(&[SOF, b'C', 0x01, SOF]).is_empty());
        // the second SOF aborted the frame; a full valid frame still decodes
        let good = encode_frame(tag::COAP, &[9]).unwrap();
        let events = framer.feed(&good);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_pre_sof_noise_is_delivered_before_frame() {
        let mut framer = Mup1Framer::new();
        let mut bytes = b"boot: ok\r\n".to_vec();
        bytes.extend_from_slice(&encode_frame(tag::COAP, &[7]).unwrap());
        let events = framer.feed(&bytes);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Mup1Event::Passthrough(b"boot: ok\r\n".to_vec()));
        assert!(matches!(events[1], Mup1Event::Frame { .. }));
    }

    #[test]
    fn test_timeout_surfaces_console_bytes() {
        let mut framer = Mup1Framer::new();
        assert!(framer.feed(b"login: ").is_empty());
        assert_eq!(
            framer.on_timeout(),
            Some(Mup1Event::Passthrough(b"login: ".to_vec()))
        );
        assert_eq!(framer.on_timeout(), None);
    }

    #[test]
    fn test_timeout_drops_partial_frame() {
        let mut framer = Mup1Framer::new();
        assert!(framer.feed(&[SOF, b'C', 1, 2, 3]).is_empty());
        assert!(framer.mid_frame());
        assert_eq!(framer.on_timeout(), None);
        assert!(!framer.mid_frame());
    }

    #[test]
    fn test_disabled_framer_passes_everything() {
        let mut framer = Mup1Framer::disabled();
        let frame = encode_frame(tag::COAP, &[1]).unwrap();
        assert_eq!(
            framer.feed(&frame),
            vec![Mup1Event::Passthrough(frame.clone())]
        );
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        assert!(encode_frame(tag::COAP, &vec![0u8; 1025]).is_err());
        assert!(encode_frame(tag::COAP, &vec![0u8; 1024]).is_ok());
    }

    #[test]
    fn test_oversized_rx_frame_resets() {
        let mut framer = Mup1Framer::new();
        let mut bytes = vec![SOF, b'C'];
        bytes.extend(std::iter::repeat(0x41).take(MAX_PAYLOAD + 1));
        assert!(framer.feed(&bytes).is_empty());
        assert!(!framer.mid_frame());
    }
}
