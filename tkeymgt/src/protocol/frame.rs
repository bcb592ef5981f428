//! Frame encoding and decoding.
//!
//! Every frame starts with a one-byte framing header followed by the opcode
//! and a payload padded to the command's fixed length:
//!
//! ```text
//!   bit  7     6..5   4..3       2        1..0
//!      +-----+------+----------+--------+---------+
//!      | rsv |  id  | endpoint | not ok | len code|
//!      +-----+------+----------+--------+---------+
//!
//!   [header] [opcode] [payload .. capacity]
//! ```
//!
//! Response payloads start with a status byte, `0x00` meaning OK. Frames
//! of the one-byte class carry no status and are taken as OK.

use {
    super::catalog::{Command, Endpoint, FrameLen},
    crate::error::{Error, Result},
    std::fmt,
};

/// Status byte meaning success.
pub const STATUS_OK: u8 = 0x00;

/// Status byte reported for frames flagged "not ok" in their header.
pub const STATUS_BAD: u8 = 0x01;

const RESERVED_BIT: u8 = 0x80;
const NOT_OK_BIT: u8 = 0x04;

/// Frame id echoed back by the device. The header has two bits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId(u8);

impl TransactionId {
    /// Largest id the framing header can carry.
    pub const MAX: u8 = 3;

    /// Create an id, rejecting values the header cannot carry.
    pub fn new(id: u8) -> Result<Self> {
        if id > Self::MAX {
            return Err(Error::Config(format!(
                "transaction id {id} out of range 0..={}",
                Self::MAX
            )));
        }
        Ok(Self(id))
    }

    /// Raw id value.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Transaction id.
    pub id: TransactionId,
    /// Endpoint the frame is for or from.
    pub endpoint: Endpoint,
    /// Length class of what follows the header.
    pub len: FrameLen,
    /// The device flagged the response as not OK.
    pub not_ok: bool,
}

impl FrameHeader {
    /// Header byte.
    pub const fn to_byte(&self) -> u8 {
        let mut byte = (self.id.0 << 5) | (self.endpoint.wire() << 3) | self.len.code();
        if self.not_ok {
            byte |= NOT_OK_BIT;
        }
        byte
    }

    /// Parse a header byte.
    pub fn parse(byte: u8) -> Result<Self> {
        if byte & RESERVED_BIT != 0 {
            return Err(Error::ProtocolMismatch(format!(
                "reserved bit set in header {byte:#04x}"
            )));
        }
        let endpoint_bits = (byte >> 3) & 0x03;
        let endpoint = Endpoint::from_wire(endpoint_bits).ok_or_else(|| {
            Error::ProtocolMismatch(format!("unexpected endpoint {endpoint_bits} in header"))
        })?;
        Ok(Self {
            id: TransactionId((byte >> 5) & 0x03),
            endpoint,
            len: FrameLen::from_code(byte),
            not_ok: byte & NOT_OK_BIT != 0,
        })
    }
}

/// An encoded frame, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    id: TransactionId,
    bytes: Vec<u8>,
}

impl Frame {
    /// Command this frame carries.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Payload after the opcode, padded to capacity.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[2..]
    }

    /// Wire bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Build a frame for `command`, zero-padding `payload` to its capacity.
pub fn encode(command: Command, id: TransactionId, payload: &[u8]) -> Result<Frame> {
    let capacity = command.capacity();
    if payload.len() > capacity {
        return Err(Error::InvalidPayload {
            command: command.name,
            len: payload.len(),
            capacity,
        });
    }

    let header = FrameHeader {
        id,
        endpoint: command.endpoint,
        len: command.len,
        not_ok: false,
    };

    let mut bytes = Vec::with_capacity(1 + command.len.size());
    bytes.push(header.to_byte());
    bytes.push(command.opcode);
    bytes.extend_from_slice(payload);
    bytes.resize(1 + command.len.size(), 0);

    Ok(Frame { command, id, bytes })
}

/// A decoded, accepted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: u8,
    payload: Vec<u8>,
}

impl Reply {
    /// Status byte (always OK for replies returned by [`decode`]).
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Whether the status is OK.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Everything after the opcode, status byte included.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Data after the status byte.
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }
}

/// Decode `raw` as the response `expected` to a request sent with `id`.
///
/// Identity is checked before status, so a frame that answers a different
/// request is a [`Error::ProtocolMismatch`] even when it reports success.
pub fn decode(expected: Command, id: TransactionId, raw: &[u8]) -> Result<Reply> {
    let Some((&first, rest)) = raw.split_first() else {
        return Err(Error::ProtocolMismatch("empty frame".to_string()));
    };
    let header = FrameHeader::parse(first)?;

    if header.id != id {
        return Err(Error::ProtocolMismatch(format!(
            "{}: expected id {id}, got {}",
            expected.name, header.id
        )));
    }
    if header.endpoint != expected.endpoint {
        return Err(Error::ProtocolMismatch(format!(
            "{}: expected endpoint {:?}, got {:?}",
            expected.name, expected.endpoint, header.endpoint
        )));
    }
    if header.not_ok {
        return Err(Error::DeviceError {
            command: expected.name,
            status: STATUS_BAD,
        });
    }
    if header.len != expected.len {
        return Err(Error::ProtocolMismatch(format!(
            "{}: expected {} byte frame, got {}",
            expected.name,
            expected.len.size(),
            header.len.size()
        )));
    }
    if rest.len() < header.len.size() {
        return Err(Error::ProtocolMismatch(format!(
            "{}: truncated frame ({} of {} bytes)",
            expected.name,
            rest.len(),
            header.len.size()
        )));
    }
    if rest[0] != expected.opcode {
        return Err(Error::ProtocolMismatch(format!(
            "expected {} ({:#04x}), got opcode {:#04x}",
            expected.name, expected.opcode, rest[0]
        )));
    }

    let payload = rest[1..header.len.size()].to_vec();
    let status = payload.first().copied().unwrap_or(STATUS_OK);
    if status != STATUS_OK {
        return Err(Error::DeviceError {
            command: expected.name,
            status,
        });
    }

    Ok(Reply { status, payload })
}
