//! The per-socket connection engine.
//!
//! A [`Link`] pairs one peer with an inbound and an outbound FIFO queue and
//! one background task that owns all socket I/O:
//!
//! ```text
//! application ─► outbound queue ─► task ─► socket
//! application ◄─ inbound queue  ◄─ task ◄─ socket
//! ```
//!
//! Each loop turn drains the outbound queue in enqueue order, flushes,
//! classifies inbound frames (Internal opcode handled here, everything else
//! queued untouched), and enforces keep-alive liveness. The application side
//! never blocks and never performs I/O directly.
//!
//! The same engine serves both roles: the server wraps accepted sockets into
//! links, the consumer connects one of its own.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::error::{Result, ServiceError};
use crate::peer::{self, PeerReader, PeerStatus, PeerWriter};
use crate::protocol::{
    decode_fixed_str, Opcode, Packet, DISCONNECT_REASON_SIZE, DISCONNECT_SERVICE,
    KEEP_ALIVE_SERVICE,
};

/// Interval between outgoing keep-alive packets.
pub const KEEP_ALIVE_DELAY: Duration = Duration::from_secs(3);

/// Silence threshold after which the remote peer is presumed dead.
pub const KEEP_ALIVE_WAIT: Duration = Duration::from_secs(6);

/// Instructions queued from the application to the background task.
enum Command {
    /// Write this packet on the next loop turn.
    Packet(Packet),
    /// Send a disconnect notice with this reason, then close.
    Disconnect(String),
    /// Close without sending anything.
    Close,
}

/// Handle to one connection: two queues plus shared peer status.
pub struct Link {
    outbound: mpsc::UnboundedSender<Command>,
    inbound: mpsc::UnboundedReceiver<Packet>,
    status: Arc<PeerStatus>,
    _task: JoinHandle<()>,
}

impl Link {
    /// Wrap an established stream into a link and spawn its background task.
    pub(crate) fn spawn<S>(stream: S, local_address: String, remote_address: String) -> Link
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (reader, writer, status) = peer::split(stream, local_address, remote_address);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(reader, writer, status.clone(), outbound_rx, inbound_tx));

        Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            status,
            _task: task,
        }
    }

    /// Connect to a remote host and spawn the engine for the new socket.
    pub(crate) async fn connect(addr: impl ToSocketAddrs) -> Result<Link> {
        let stream = TcpStream::connect(addr).await?;
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        Ok(Link::spawn(stream, local, remote))
    }

    /// Enqueue a packet for writing. Non-blocking, safe from any context.
    pub fn write(&self, packet: Packet) {
        let _ = self.outbound.send(Command::Packet(packet));
    }

    /// Dequeue one already-classified application packet, or `None` if the
    /// inbound queue is empty. Never suspends.
    pub fn read(&mut self) -> Option<Packet> {
        self.inbound.try_recv().ok()
    }

    /// Gets if packets are available to read.
    pub fn available(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Gets if the underlying peer is still connected.
    pub fn connected(&self) -> bool {
        self.status.connected()
    }

    /// Request a disconnect with the given reason. Ordered after packets
    /// already enqueued; the notice is sent to the remote peer best-effort.
    pub fn disconnect(&self, reason: &str) {
        let _ = self.outbound.send(Command::Disconnect(reason.to_string()));
    }

    /// Close the connection without notifying the remote peer.
    pub fn close(&self) {
        let _ = self.outbound.send(Command::Close);
    }

    /// Shared peer status: addresses, state, disconnect reason.
    pub fn status(&self) -> &Arc<PeerStatus> {
        &self.status
    }
}

/// The background loop. Runs until the peer disconnects.
async fn run<S>(
    mut reader: PeerReader<S>,
    mut writer: PeerWriter<S>,
    status: Arc<PeerStatus>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<Packet>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    tracing::info!(remote = %status.remote_address(), "connection up");

    // First keep-alive goes out immediately; liveness clock starts now.
    let mut next_keep_alive = Instant::now();
    let mut liveness_deadline = Instant::now() + KEEP_ALIVE_WAIT;

    while status.connected() {
        tokio::select! {
            // Outbound drains ahead of reads, keeping FIFO write order.
            biased;

            command = outbound.recv() => match command {
                Some(command) => {
                    apply(command, &mut writer).await;
                    while let Ok(command) = outbound.try_recv() {
                        apply(command, &mut writer).await;
                    }
                    writer.flush().await;
                }
                None => {
                    // Last handle dropped: best-effort notice, then close.
                    writer.disconnect("Disconnected", true).await;
                }
            },

            result = reader.read_packets() => match result {
                Ok(packets) => {
                    for packet in packets {
                        if packet.opcode() == Opcode::Internal {
                            handle_internal(packet, &mut writer, &mut liveness_deadline).await;
                        } else {
                            let _ = inbound.send(packet);
                        }
                    }
                }
                Err(ServiceError::Io(_)) | Err(ServiceError::ConnectionClosed) => {
                    writer.disconnect("Socket read error", false).await;
                }
                Err(err) => {
                    // Hard decode error: the stream cannot be resynchronized.
                    tracing::warn!(remote = %status.remote_address(), error = %err, "bad packet received");
                    writer.disconnect(&err.to_string(), false).await;
                }
            },

            _ = time::sleep_until(next_keep_alive) => {
                let keep_alive =
                    Packet::internal(status.next_sequence(), KEEP_ALIVE_SERVICE, Bytes::new());
                if writer.write(&keep_alive).await {
                    writer.flush().await;
                }
                next_keep_alive = Instant::now() + KEEP_ALIVE_DELAY;
            },

            _ = time::sleep_until(liveness_deadline) => {
                writer.disconnect("Timeout", true).await;
            },
        }
    }

    writer.close().await;
    tracing::debug!(
        remote = %status.remote_address(),
        reason = status.disconnect_reason().as_deref().unwrap_or(""),
        "connection down"
    );
}

/// Apply one queued command to the peer.
async fn apply<S: tokio::io::AsyncWrite>(command: Command, writer: &mut PeerWriter<S>) {
    match command {
        Command::Packet(packet) => {
            writer.write(&packet).await;
        }
        Command::Disconnect(reason) => writer.disconnect(&reason, true).await,
        Command::Close => writer.close().await,
    }
}

/// Handle an Internal control frame. Never surfaced to application code.
async fn handle_internal<S: tokio::io::AsyncWrite>(
    packet: Packet,
    writer: &mut PeerWriter<S>,
    liveness_deadline: &mut Instant,
) {
    match packet.service() {
        KEEP_ALIVE_SERVICE => {
            // Liveness is mutual and implicit; no reply.
            *liveness_deadline = Instant::now() + KEEP_ALIVE_WAIT;
        }
        DISCONNECT_SERVICE => {
            // Never re-send here, or both sides would exchange notices
            // forever.
            if packet.payload().len() == DISCONNECT_REASON_SIZE {
                let reason = decode_fixed_str(packet.payload());
                writer.disconnect(&reason, false).await;
            } else {
                writer.disconnect("Disconnected by server", false).await;
            }
        }
        _ => {
            writer.disconnect("Invalid internal service", true).await;
        }
    }
}
