use n0_error::{e, stack_error};

/// Length of the ICMP header preceding the echo payload.
pub const HEADER_LEN: usize = 8;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;

/// ICMP message kinds recognized by the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EchoKind {
    /// Echo Request (wire type 8). Carries a whole HTTP request.
    #[display("echo request")]
    Request,
    /// Echo Reply (wire type 0). Carries one response fragment.
    #[display("echo reply")]
    Reply,
}

impl EchoKind {
    fn wire_type(self) -> u8 {
        match self {
            EchoKind::Request => TYPE_ECHO_REQUEST,
            EchoKind::Reply => TYPE_ECHO_REPLY,
        }
    }
}

/// A decoded ICMP echo message.
///
/// The identifier doubles as the tunnel session id; the sequence number
/// orders response fragments (sequence 0 is reserved for the request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub kind: EchoKind,
    pub code: u8,
    pub ident: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl IcmpEcho {
    pub fn request(ident: u16, seq: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EchoKind::Request,
            code: 0,
            ident,
            seq,
            payload: payload.into(),
        }
    }

    pub fn reply(ident: u16, seq: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EchoKind::Reply,
            code: 0,
            ident,
            seq,
            payload: payload.into(),
        }
    }

    /// Returns true for the empty fragment that closes a response stream.
    pub fn is_terminator(&self) -> bool {
        self.seq > 0 && self.payload.is_empty()
    }

    /// Serializes the message with a valid internet checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.wire_type());
        buf.push(self.code);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.ident.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let sum = checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Parses a raw ICMP message.
    ///
    /// The checksum is not verified; a corrupted fragment at worst corrupts
    /// one session, and the kernel already discarded frames that failed the
    /// link-layer check.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            let len = buf.len();
            return Err(e!(WireError::TooShort { len }));
        }
        let kind = match buf[0] {
            TYPE_ECHO_REQUEST => EchoKind::Request,
            TYPE_ECHO_REPLY => EchoKind::Reply,
            wire_type => return Err(e!(WireError::UnknownKind { wire_type })),
        };
        Ok(Self {
            kind,
            code: buf[1],
            ident: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors decoding an inbound packet. Recovery is always to drop the packet.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum WireError {
    /// The buffer is shorter than the 8-byte ICMP header.
    #[error("icmp message too short: {len} bytes")]
    TooShort { len: usize },
    /// The type byte is neither echo request nor echo reply.
    #[error("unknown icmp type {wire_type}")]
    UnknownKind { wire_type: u8 },
}

/// Internet checksum per RFC 1071: one's-complement sum of big-endian
/// 16-bit words, odd trailing byte padded into the high half.
fn checksum(mut data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    while data.len() >= 2 {
        sum = sum.wrapping_add(u16::from_be_bytes([data[0], data[1]]) as u32);
        data = &data[2..];
    }
    if let [last] = data {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
