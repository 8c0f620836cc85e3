//! TCP listener that turns accepted sockets into links.
//!
//! The server owns nothing but the accept task; every accepted connection is
//! wrapped into a [`Link`] and pushed into the shared connection set, where
//! the owning host polls it. Stopping the server stops accepting only; live
//! connections keep running until they disconnect or are disconnected.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::link::Link;

/// The shared set of live connections, appended by the accept task and
/// drained/polled by the owner.
pub(crate) type ConnectionSet = Arc<Mutex<Vec<Link>>>;

pub(crate) fn lock_connections(connections: &ConnectionSet) -> std::sync::MutexGuard<'_, Vec<Link>> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts TCP connections and hands them to the connection set as links.
pub(crate) struct Server {
    local_addr: SocketAddr,
    connections: ConnectionSet,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind a listener. Port 0 binds an ephemeral port; the resolved address
    /// is available via [`Server::local_addr`] before `start` is called.
    pub(crate) async fn bind(addr: impl ToSocketAddrs) -> Result<(Server, TcpListener)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Server {
            local_addr,
            connections: Arc::new(Mutex::new(Vec::new())),
            accept_task: None,
        };
        Ok((server, listener))
    }

    /// Spawn the accept loop. Each accepted socket becomes a link in the
    /// connection set immediately; its engine starts exchanging keep-alives
    /// without waiting for the first poll.
    pub(crate) fn start(&mut self, listener: TcpListener) {
        let connections = self.connections.clone();
        let local = self.local_addr.to_string();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(%remote, "accepted connection");
                        let link = Link::spawn(stream, local.clone(), remote.to_string());
                        lock_connections(&connections).push(link);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        }));
    }

    /// Stop accepting new connections. Existing links are untouched.
    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }

    /// The resolved listen address.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the shared connection set.
    pub(crate) fn connections(&self) -> ConnectionSet {
        self.connections.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
