//! Wire format encoding and decoding.
//!
//! Implements the 96-byte header format:
//! ```text
//! ┌───────┬────────┬─────────┬──────────┬──────────┬──────────┬───────────┐
//! │ Magic │ Opcode │ Length  │ Sequence │ Reserved │ Token    │ Service   │
//! │ 5 B   │ 1 B    │ 4 B i32 │ 2 B u16  │ 4 B zero │ 32 B     │ 48 B      │
//! └───────┴────────┴─────────┴──────────┴──────────┴──────────┴───────────┘
//! ```
//!
//! Multi-byte integers are Little Endian. Token and service are ASCII,
//! NUL-padded to their fixed widths. The payload follows the header and is
//! exactly `length` bytes of opaque data.

use bytes::Bytes;

use crate::error::{Result, ServiceError};

/// The magic prefixing all packets.
pub const MAGIC: &[u8; 5] = b"JSPKZ";

/// The fixed wire width of an authenticating token.
pub const TOKEN_SIZE: usize = 32;

/// The fixed wire width of a service name.
pub const SERVICE_SIZE: usize = 48;

/// Header size in bytes (fixed, exactly 96).
pub const HEADER_SIZE: usize = MAGIC.len() + 1 + 4 + 2 + 4 + TOKEN_SIZE + SERVICE_SIZE;

/// Default maximum payload size (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Reserved control service announcing liveness.
pub const KEEP_ALIVE_SERVICE: &str = "__KeepAlive";

/// Reserved control service carrying a disconnect notice.
pub const DISCONNECT_SERVICE: &str = "__Disconnect";

/// Fixed encoding width of a disconnect reason payload.
pub const DISCONNECT_REASON_SIZE: usize = 255;

/// Packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Protocol control (keep-alive, disconnect notice). Never surfaced to
    /// application code.
    Internal = 0,
    /// Fire-and-forget, no reply expected.
    Message = 1,
    /// An outbound call, or its reply. A reply reuses the original sequence,
    /// service and token; correlation is entirely sequence-number based.
    Request = 2,
}

impl Opcode {
    /// Decode an opcode byte, rejecting values outside the protocol set.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::Internal),
            1 => Ok(Opcode::Message),
            2 => Ok(Opcode::Request),
            other => Err(ServiceError::UnknownOpcode(other)),
        }
    }
}

/// Encode a string into a NUL-padded fixed-width ASCII buffer.
///
/// The caller has already validated that `s` fits in `width`; anything longer
/// is truncated rather than overrunning the field.
pub fn encode_fixed_str(s: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Decode a fixed-width ASCII buffer, copying bytes up to the first NUL.
pub fn decode_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf[..end].iter().map(|&b| b as char).collect()
}

/// Decoded header from wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Packet opcode.
    pub opcode: Opcode,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// Wrapping 16-bit sequence number.
    pub sequence: u16,
    /// Authentication token (≤ 32 ASCII characters).
    pub token: String,
    /// Service name (≤ 48 ASCII characters).
    pub service: String,
}

impl Header {
    /// Encode the header to its fixed 96-byte wire form.
    ///
    /// Assumes token and service bounds were validated before the packet was
    /// constructed; the fixed-width encoder truncates rather than overruns.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..5].copy_from_slice(MAGIC);
        buf[5] = self.opcode as u8;
        buf[6..10].copy_from_slice(&(self.payload_length as i32).to_le_bytes());
        buf[10..12].copy_from_slice(&self.sequence.to_le_bytes());
        // bytes 12..16 reserved, left zero
        buf[16..16 + TOKEN_SIZE].copy_from_slice(&encode_fixed_str(&self.token, TOKEN_SIZE));
        buf[48..48 + SERVICE_SIZE].copy_from_slice(&encode_fixed_str(&self.service, SERVICE_SIZE));
        buf
    }

    /// Decode a header from at least [`HEADER_SIZE`] bytes.
    ///
    /// Fails with a distinguishable protocol error on a short buffer,
    /// mismatched magic, an opcode outside the protocol set, or a negative
    /// length field. The caller must turn any of these into a
    /// connection-local disconnect, never a process-level fault.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ServiceError::TruncatedHeader(buf.len()));
        }

        if &buf[0..5] != MAGIC {
            return Err(ServiceError::InvalidMagic);
        }

        let opcode = Opcode::from_u8(buf[5])?;
        let length = i32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if length < 0 {
            return Err(ServiceError::PayloadLength(i64::from(length)));
        }

        let sequence = u16::from_le_bytes([buf[10], buf[11]]);
        // bytes 12..16 reserved, ignored
        let token = decode_fixed_str(&buf[16..16 + TOKEN_SIZE]);
        let service = decode_fixed_str(&buf[48..48 + SERVICE_SIZE]);

        Ok(Self {
            opcode,
            payload_length: length as u32,
            sequence,
            token,
            service,
        })
    }
}

/// A complete protocol packet: header plus opaque payload bytes.
///
/// Uses `bytes::Bytes` for cheap payload sharing between the connection
/// engine and the dispatch layer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Decoded or constructed header.
    pub header: Header,
    /// Payload bytes (may be empty, e.g. for keep-alives).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet; the header length field tracks the payload.
    pub fn new(
        opcode: Opcode,
        sequence: u16,
        token: impl Into<String>,
        service: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            header: Header {
                opcode,
                payload_length: payload.len() as u32,
                sequence,
                token: token.into(),
                service: service.into(),
            },
            payload,
        }
    }

    /// Create an Internal control packet.
    pub(crate) fn internal(sequence: u16, service: &str, payload: Bytes) -> Self {
        Self::new(Opcode::Internal, sequence, "", service, payload)
    }

    /// Encode the full packet (header and payload) into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Get the packet opcode.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Get the sequence number.
    #[inline]
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// Get the authentication token.
    #[inline]
    pub fn token(&self) -> &str {
        &self.header.token
    }

    /// Get the service name.
    #[inline]
    pub fn service(&self) -> &str {
        &self.header.service
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
