//! Frame encoding and decoding for the SDP wire protocol.
//!
//! Every message on every media uses the same layout:
//!
//! ```text
//! +--------+------+---------+------------------------------+
//! | CRC32  | type | conv id | payload (null-terminated     |
//! |   4    |  1   |    2    |  fields)                     |
//! +--------+------+---------+------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian. The CRC covers everything after the
//! CRC field. Parsing does not check it; [`verify_crc`] is there for
//! transports that want to reject corrupted frames at their boundary.

use std::fmt;
use std::ops::Range;

use sdp_transport::MediaType;
use tracing::warn;

use crate::error::FrameError;
use crate::peer::PeerHandle;

/// Preamble size: CRC (4) + work type (1) + conversation id (2)
pub const PREAMBLE_LEN: usize = 7;

/// Field terminator inside payloads
pub const FIELD_TERMINATOR: u8 = 0;

/// Message kinds carried in the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkType {
    /// Capability exchange ("HI" / "HIR")
    Handshake = 0,
    /// Request expecting a reply
    Request = 1,
    /// Reply to a request
    Reply = 2,
    /// Unsolicited data
    Data = 3,
    /// Handled inline with an immediate receipt
    Priority = 4,
    /// Wake/sleep negotiation ("WHEN" / "NEXT")
    Orchestration = 5,
    /// Keep-alive placeholder
    Qos = 6,
}

impl WorkType {
    /// All work types in wire order
    pub const ALL: [WorkType; 7] = [
        WorkType::Handshake,
        WorkType::Request,
        WorkType::Reply,
        WorkType::Data,
        WorkType::Priority,
        WorkType::Orchestration,
        WorkType::Qos,
    ];

    /// Lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            WorkType::Handshake => "handshake",
            WorkType::Request => "request",
            WorkType::Reply => "reply",
            WorkType::Data => "data",
            WorkType::Priority => "priority",
            WorkType::Orchestration => "orchestration",
            WorkType::Qos => "qos",
        }
    }

    /// Whether an application filter may be installed for this type
    pub const fn is_filterable(self) -> bool {
        matches!(self, WorkType::Request | WorkType::Reply | WorkType::Data)
    }
}

impl TryFrom<u8> for WorkType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Data),
            4 => Ok(Self::Priority),
            5 => Ok(Self::Orchestration),
            6 => Ok(Self::Qos),
            _ => Err(FrameError::UnknownWorkType(value)),
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for WorkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkType::ALL
            .into_iter()
            .find(|w| w.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown work type: {s}"))
    }
}

/// CRC-32, polynomial 0x04C11DB7, MSB-first, init and final XOR 0xFFFFFFFF
pub fn crc32_be(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    !crc
}

/// Lay out preamble and payload.
pub fn build_frame(work_type: WorkType, conversation_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PREAMBLE_LEN + payload.len());
    frame.extend_from_slice(&[0; 4]);
    frame.push(work_type as u8);
    frame.extend_from_slice(&conversation_id.to_be_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32_be(&frame[4..]);
    frame[..4].copy_from_slice(&crc.to_be_bytes());
    frame
}

/// Parse a received frame into a [`WorkItem`].
///
/// # Errors
/// - [`FrameError::TooShort`] for fewer than [`PREAMBLE_LEN`] bytes
/// - [`FrameError::UnknownWorkType`] for a type byte above 6
pub fn parse_frame(bytes: &[u8]) -> Result<WorkItem, FrameError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(FrameError::TooShort {
            expected: PREAMBLE_LEN,
            actual: bytes.len(),
        });
    }

    let crc = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let work_type = WorkType::try_from(bytes[4])?;
    let conversation_id = u16::from_be_bytes([bytes[5], bytes[6]]);

    let mut payload = bytes[PREAMBLE_LEN..].to_vec();
    if let Some(last) = payload.last_mut() {
        if *last != FIELD_TERMINATOR {
            warn!(
                %work_type,
                conversation_id,
                "Payload not null-terminated, truncating last byte"
            );
            *last = FIELD_TERMINATOR;
        }
    }

    Ok(WorkItem::from_parts(work_type, conversation_id, crc, payload))
}

/// Check the CRC field of a raw frame.
///
/// # Errors
/// Returns [`FrameError::TooShort`] or [`FrameError::CrcMismatch`].
pub fn verify_crc(bytes: &[u8]) -> Result<u32, FrameError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(FrameError::TooShort {
            expected: PREAMBLE_LEN,
            actual: bytes.len(),
        });
    }
    let expected = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let actual = crc32_be(&bytes[4..]);
    if expected == actual {
        Ok(actual)
    } else {
        Err(FrameError::CrcMismatch { expected, actual })
    }
}

/// A parsed message, owned by whichever queue or handler holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Message kind
    pub work_type: WorkType,
    /// Conversation the message belongs to
    pub conversation_id: u16,
    /// CRC field as received (or computed, for outbound items)
    pub crc: u32,
    /// Raw payload
    pub payload: Vec<u8>,
    parts: Vec<Range<usize>>,
    /// Media the message arrived on
    pub media: Option<MediaType>,
    /// Sending peer, once resolved
    pub peer: Option<PeerHandle>,
}

impl WorkItem {
    /// Build an outbound item; the CRC is computed as the frame would carry it.
    pub fn new(work_type: WorkType, conversation_id: u16, payload: Vec<u8>) -> Self {
        let crc = crc32_be(&build_frame(work_type, conversation_id, &payload)[4..]);
        Self::from_parts(work_type, conversation_id, crc, payload)
    }

    fn from_parts(work_type: WorkType, conversation_id: u16, crc: u32, payload: Vec<u8>) -> Self {
        let parts = split_fields(&payload);
        Self {
            work_type,
            conversation_id,
            crc,
            payload,
            parts,
            media: None,
            peer: None,
        }
    }

    /// Field ranges into the payload
    pub fn parts(&self) -> &[Range<usize>] {
        &self.parts
    }

    /// Number of fields (nulls + 1)
    pub fn field_count(&self) -> usize {
        self.parts.len()
    }

    /// Field `index`, without its terminator
    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.parts.get(index).map(|r| &self.payload[r.clone()])
    }

    /// Field `index` as UTF-8
    pub fn field_str(&self, index: usize) -> Option<&str> {
        self.field(index).and_then(|f| std::str::from_utf8(f).ok())
    }

    /// All fields in order
    pub fn fields(&self) -> impl Iterator<Item = &[u8]> {
        self.parts.iter().map(|r| &self.payload[r.clone()])
    }

    /// Serialize back to wire form
    pub fn to_frame(&self) -> Vec<u8> {
        build_frame(self.work_type, self.conversation_id, &self.payload)
    }
}

fn split_fields(payload: &[u8]) -> Vec<Range<usize>> {
    let mut parts = Vec::with_capacity(4);
    let mut start = 0;
    for (i, &b) in payload.iter().enumerate() {
        if b == FIELD_TERMINATOR {
            parts.push(start..i);
            start = i + 1;
        }
    }
    parts.push(start..payload.len());
    parts
}

/// Builds null-terminated field payloads.
///
/// ```
/// use sdp_core::frame::PayloadBuilder;
///
/// let payload = PayloadBuilder::new().text("HI").text("node-a").build();
/// assert_eq!(payload, b"HI\0node-a\0");
/// ```
#[derive(Debug, Clone, Default)]
pub struct PayloadBuilder {
    buf: Vec<u8>,
}

impl PayloadBuilder {
    /// Empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes as one field
    pub fn field(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self.buf.push(FIELD_TERMINATOR);
        self
    }

    /// Append a text field
    pub fn text(self, s: &str) -> Self {
        self.field(s.as_bytes())
    }

    /// Append a decimal number field
    pub fn number(self, n: u64) -> Self {
        self.text(&n.to_string())
    }

    /// Finish
    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // CRC-32/BZIP2 check value
        assert_eq!(crc32_be(b"123456789"), 0xFC89_1918);
        assert_eq!(crc32_be(b""), 0);
    }

    #[test]
    fn test_work_type_try_from() {
        assert_eq!(WorkType::try_from(0), Ok(WorkType::Handshake));
        assert_eq!(WorkType::try_from(4), Ok(WorkType::Priority));
        assert_eq!(WorkType::try_from(6), Ok(WorkType::Qos));
        assert_eq!(
            WorkType::try_from(7),
            Err(FrameError::UnknownWorkType(7))
        );
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(WorkType::Request, 0x1234, b"ping\0");
        assert_eq!(frame.len(), PREAMBLE_LEN + 5);
        assert_eq!(frame[4], 1);
        assert_eq!(&frame[5..7], &[0x12, 0x34]);
        assert_eq!(&frame[7..], b"ping\0");

        let crc = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(crc, crc32_be(&frame[4..]));
    }

    #[test]
    fn test_parse_roundtrip() {
        let frame = build_frame(WorkType::Data, 77, b"a\0bc\0");
        let item = parse_frame(&frame).unwrap();
        assert_eq!(item.work_type, WorkType::Data);
        assert_eq!(item.conversation_id, 77);
        assert_eq!(item.payload, b"a\0bc\0");
        assert_eq!(item.field_count(), 3);
        assert_eq!(item.field(0), Some(&b"a"[..]));
        assert_eq!(item.field(1), Some(&b"bc"[..]));
        assert_eq!(item.field(2), Some(&b""[..]));
        assert_eq!(item.parts()[0].start, 0);
        assert_eq!(item.to_frame(), frame);
    }

    #[test]
    fn test_parse_too_short() {
        let err = parse_frame(&[0u8; 6]).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooShort {
                expected: 7,
                actual: 6
            }
        );
        assert!(parse_frame(&[]).is_err());
    }

    #[test]
    fn test_parse_preamble_only() {
        let frame = build_frame(WorkType::Qos, 1, b"");
        assert_eq!(frame.len(), 7);
        let item = parse_frame(&frame).unwrap();
        assert!(item.payload.is_empty());
        assert_eq!(item.field_count(), 1);
        assert_eq!(item.field(0), Some(&b""[..]));
    }

    #[test]
    fn test_parse_forces_terminator() {
        let frame = build_frame(WorkType::Data, 2, b"abc");
        let item = parse_frame(&frame).unwrap();
        assert_eq!(item.payload, b"ab\0");
        assert_eq!(item.field_str(0), Some("ab"));
        // CRC is the received one, untouched
        assert_eq!(verify_crc(&frame), Ok(item.crc));
    }

    #[test]
    fn test_parse_unknown_work_type() {
        let mut frame = build_frame(WorkType::Data, 2, b"x\0");
        frame[4] = 0x42;
        assert_eq!(
            parse_frame(&frame).unwrap_err(),
            FrameError::UnknownWorkType(0x42)
        );
    }

    #[test]
    fn test_verify_crc_detects_corruption() {
        let mut frame = build_frame(WorkType::Request, 9, b"hello\0");
        assert!(verify_crc(&frame).is_ok());
        frame[8] ^= 0x01;
        assert!(matches!(
            verify_crc(&frame),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_builder() {
        let payload = PayloadBuilder::new()
            .text("NEXT")
            .number(1500)
            .field(&[0xAA, 0xBB])
            .build();
        assert_eq!(payload, b"NEXT\x001500\0\xAA\xBB\0");

        let item = WorkItem::new(WorkType::Request, 3, payload);
        assert_eq!(item.field_count(), 4);
        assert_eq!(item.field_str(1), Some("1500"));
        assert_eq!(verify_crc(&item.to_frame()), Ok(item.crc));
    }

    proptest::proptest! {
        #[test]
        fn prop_field_count_is_nulls_plus_one(payload in proptest::collection::vec(0u8..4, 0..64)) {
            let item = WorkItem::new(WorkType::Data, 0, payload.clone());
            let nulls = payload.iter().filter(|&&b| b == FIELD_TERMINATOR).count();
            proptest::prop_assert_eq!(item.field_count(), nulls + 1);
            proptest::prop_assert_eq!(item.parts()[0].start, 0);
        }
    }
}
