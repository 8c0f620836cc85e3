//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management and a two-state machine for
//! fragmented frames:
//! - `WaitingForHeader`: need at least 96 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! A header that fails validation (bad magic, unknown opcode, bad length) is
//! a hard decode error: the byte stream cannot be resynchronized, so the
//! error propagates to the owning connection, which disconnects that one
//! connection and nothing else.

use bytes::BytesMut;

use super::wire::{Header, Packet, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::{Result, ServiceError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Returns every packet completed by this chunk; fragmented data stays
    /// buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns the underlying protocol error if a header fails validation.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.try_extract_one()? {
            packets.push(packet);
        }

        Ok(packets)
    }

    /// Try to extract a single packet from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Packet>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])?;

                    if header.payload_length > self.max_payload_size {
                        return Err(ServiceError::PayloadLength(i64::from(
                            header.payload_length,
                        )));
                    }

                    let _ = self.buffer.split_to(HEADER_SIZE);

                    let remaining = header.payload_length;
                    self.state = State::WaitingForPayload { header, remaining };
                    // fall through and try the payload immediately
                }

                State::WaitingForPayload { header, remaining } => {
                    let remaining = *remaining as usize;

                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    let header = header.clone();
                    self.state = State::WaitingForHeader;

                    return Ok(Some(Packet { header, payload }));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
