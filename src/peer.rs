//! The raw socket endpoint: one frame read/write at a time.
//!
//! A peer is split into a read half and a write half so the connection
//! engine's background task can wait on inbound bytes and drain its outbound
//! queue concurrently. Everything the rest of the crate needs to observe
//! (state, disconnect reason, addresses, the sequence counter) lives in the
//! shared [`PeerStatus`] handle.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Result, ServiceError};
use crate::protocol::{
    encode_fixed_str, FrameBuffer, Packet, DISCONNECT_REASON_SIZE, DISCONNECT_SERVICE,
};

/// The state of a peer. Monotonic: it never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerState {
    /// The socket is open and frames flow.
    Connected = 0,
    /// A disconnect is underway; no new application traffic.
    Disconnecting = 1,
    /// The socket is closed.
    Disconnected = 2,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerState::Connected,
            1 => PeerState::Disconnecting,
            _ => PeerState::Disconnected,
        }
    }
}

/// Shared view of one socket endpoint.
///
/// Held by the background task, the link handle, and anything that needs to
/// ask "are we still connected, and if not, why".
pub struct PeerStatus {
    state: AtomicU8,
    sequence: AtomicU16,
    reason: Mutex<Option<String>>,
    local_address: String,
    remote_address: String,
}

impl PeerStatus {
    pub(crate) fn new(local_address: String, remote_address: String) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PeerState::Connected as u8),
            sequence: AtomicU16::new(0),
            reason: Mutex::new(None),
            local_address,
            remote_address,
        })
    }

    /// Gets if the local peer is connected to the remote peer.
    pub fn connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Gets the current state.
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state; `fetch_max` keeps the transition monotonic.
    pub(crate) fn advance(&self, state: PeerState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Draw the next sequence number, wrapping at 65536.
    ///
    /// Assigned at packet creation time, which lets a caller key a pending
    /// response callback before the socket write happens.
    pub(crate) fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Record the disconnect reason. The first writer wins.
    pub(crate) fn set_reason(&self, reason: &str) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    /// Gets the disconnect reason, `None` if still connected.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Gets the string representation of the local address.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Gets the string representation of the remote address.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }
}

/// Split a stream into the peer's read and write halves.
pub(crate) fn split<S>(
    stream: S,
    local_address: String,
    remote_address: String,
) -> (PeerReader<S>, PeerWriter<S>, Arc<PeerStatus>)
where
    S: AsyncRead + AsyncWrite,
{
    let status = PeerStatus::new(local_address, remote_address);
    let (read_half, write_half) = tokio::io::split(stream);

    let reader = PeerReader {
        inner: read_half,
        frames: FrameBuffer::new(),
        buf: vec![0u8; 8 * 1024],
    };
    let writer = PeerWriter {
        inner: write_half,
        status: status.clone(),
    };

    (reader, writer, status)
}

/// The reading half of a peer: raw bytes in, decoded packets out.
pub(crate) struct PeerReader<S> {
    inner: ReadHalf<S>,
    frames: FrameBuffer,
    buf: Vec<u8>,
}

impl<S: AsyncRead> PeerReader<S> {
    /// Read once from the socket and return every packet completed by the
    /// new bytes, in wire order.
    ///
    /// An I/O failure or EOF surfaces as [`ServiceError::ConnectionClosed`] /
    /// [`ServiceError::Io`]; a framing failure surfaces as the protocol
    /// error. Either way the caller disconnects this connection only.
    pub(crate) async fn read_packets(&mut self) -> Result<Vec<Packet>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Err(ServiceError::ConnectionClosed);
        }
        self.frames.push(&self.buf[..n])
    }
}

/// The writing half of a peer, plus the disconnect handshake.
pub(crate) struct PeerWriter<S> {
    inner: WriteHalf<S>,
    status: Arc<PeerStatus>,
}

impl<S: AsyncWrite> PeerWriter<S> {
    /// Serialize and transmit one packet.
    ///
    /// On failure the peer disconnects locally with reason
    /// "Socket write error"; the error is not propagated further.
    pub(crate) async fn write(&mut self, packet: &Packet) -> bool {
        if self.status.state() == PeerState::Disconnected {
            return false;
        }

        if self.inner.write_all(&packet.encode()).await.is_err() {
            self.status.advance(PeerState::Disconnecting);
            self.status.set_reason("Socket write error");
            self.close().await;
            return false;
        }

        true
    }

    /// Flush buffered bytes to the socket. Errors behave like write errors.
    pub(crate) async fn flush(&mut self) {
        if self.status.state() == PeerState::Disconnected {
            return;
        }

        if self.inner.flush().await.is_err() {
            self.status.advance(PeerState::Disconnecting);
            self.status.set_reason("Socket write error");
            self.close().await;
        }
    }

    /// Disconnect the peer, optionally sending the reason to the remote end.
    ///
    /// The reason travels as an Internal `__Disconnect` packet whose payload
    /// is the reason fixed-encoded into exactly 255 bytes (truncated if
    /// longer). The reason is recorded locally only if none is recorded yet.
    pub(crate) async fn disconnect(&mut self, reason: &str, send: bool) {
        if self.status.state() == PeerState::Disconnected {
            return;
        }

        self.status.advance(PeerState::Disconnecting);

        if send {
            let payload = Bytes::from(encode_fixed_str(reason, DISCONNECT_REASON_SIZE));
            let notice = Packet::internal(
                self.status.next_sequence(),
                DISCONNECT_SERVICE,
                payload,
            );
            if self.write(&notice).await {
                self.flush().await;
            }
        }

        self.status.set_reason(reason);
        self.close().await;
    }

    /// Close the peer. Idempotent; swallows socket errors.
    pub(crate) async fn close(&mut self) {
        self.status.advance(PeerState::Disconnected);
        let _ = self.inner.shutdown().await;
    }
}
