//! The connecting node: sends messages and requests to a host, correlates
//! replies, and serves the host's own traffic.
//!
//! Like the host, a consumer is polled. Each [`Consumer::poll`] drains the
//! link's inbound queue; a Request-kind transaction probes the pending table
//! first (it may be the reply to one of our outstanding calls) and falls
//! back to the local service registry. A consumer is stricter than a host:
//! any routing miss or undecodable payload disconnects it, since a
//! misbehaving host is not worth staying connected to.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::ToSocketAddrs;

use crate::error::Result;
use crate::link::Link;
use crate::peer::PeerStatus;
use crate::service::{ServiceHandler, ServiceRegistry, Visibility};
use crate::transaction::{Transaction, TransactionKind};

/// Callback invoked with the reply document of one outstanding request.
type ResponseCallback = Box<dyn FnOnce(&Value) + Send>;

/// A connected client node.
pub struct Consumer {
    link: Link,
    registry: ServiceRegistry,
    pending: HashMap<u16, ResponseCallback>,
}

impl Consumer {
    /// Connect to a host. The connection engine starts exchanging
    /// keep-alives immediately.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Consumer> {
        let link = Link::connect(addr).await?;
        Ok(Consumer {
            link,
            registry: ServiceRegistry::new(),
            pending: HashMap::new(),
        })
    }

    /// Bind a handler for messages the host pushes to us.
    pub fn bind_message(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        handler: impl Fn(&Value) + Send + 'static,
    ) -> Result<()> {
        self.registry
            .bind(name, visibility, ServiceHandler::message(handler))
    }

    /// Bind a handler for requests the host makes of us.
    pub fn bind_request(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        handler: impl Fn(&Value) -> Value + Send + 'static,
    ) -> Result<()> {
        self.registry
            .bind(name, visibility, ServiceHandler::request(handler))
    }

    /// Remove a binding.
    pub fn unbind(&mut self, name: &str) -> Result<()> {
        self.registry.unbind(name)
    }

    /// Send a fire-and-forget message without a token.
    pub fn message(&self, service: impl Into<String>, value: Value) -> Result<()> {
        self.message_with_token("", service, value)
    }

    /// Send a fire-and-forget message carrying an authenticating token.
    pub fn message_with_token(
        &self,
        token: impl Into<String>,
        service: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let transaction = Transaction::message(token, service, value)?;
        self.link.write(transaction.to_packet()?);
        Ok(())
    }

    /// Send a request without a token; `callback` fires with the reply.
    pub fn request(
        &mut self,
        service: impl Into<String>,
        value: Value,
        callback: impl FnOnce(&Value) + Send + 'static,
    ) -> Result<()> {
        self.request_with_token("", service, value, callback)
    }

    /// Send a request carrying an authenticating token.
    ///
    /// The sequence number is drawn and the pending entry registered before
    /// the write is enqueued, so the reply can never outrun its callback.
    pub fn request_with_token(
        &mut self,
        token: impl Into<String>,
        service: impl Into<String>,
        value: Value,
        callback: impl FnOnce(&Value) + Send + 'static,
    ) -> Result<()> {
        let sequence = self.link.status().next_sequence();
        let transaction = Transaction::request(token, service, value)?.with_sequence(sequence);
        let packet = transaction.to_packet()?;

        self.pending.insert(sequence, Box::new(callback));
        self.link.write(packet);
        Ok(())
    }

    /// Drain and dispatch all queued inbound traffic. Returns the number of
    /// transactions that reached a callback or handler.
    pub fn poll(&mut self) -> usize {
        let mut dispatched = 0;

        while let Some(packet) = self.link.read() {
            let transaction = match Transaction::from_packet(&packet) {
                Ok(transaction) => transaction,
                Err(err) => {
                    tracing::warn!(
                        remote = %self.link.status().remote_address(),
                        service = packet.service(),
                        error = %err,
                        "undecodable transaction"
                    );
                    self.link.disconnect("Malformed or invalid JSON");
                    break;
                }
            };

            // A Request may be a reply to one of ours; the pending table is
            // probed before any service binding.
            if transaction.kind() == TransactionKind::Request {
                if let Some(callback) = self.pending.remove(&transaction.sequence()) {
                    callback(transaction.value());
                    dispatched += 1;
                    continue;
                }
            }

            if self.dispatch(&transaction) {
                dispatched += 1;
            } else {
                tracing::debug!(
                    service = transaction.service(),
                    "no matching service"
                );
                self.link.disconnect("Service not found");
                break;
            }
        }

        dispatched
    }

    fn dispatch(&self, transaction: &Transaction) -> bool {
        let Some(service) = self.registry.get(transaction.service()) else {
            return false;
        };

        match (transaction.kind(), service.handler()) {
            (TransactionKind::Message, ServiceHandler::Message(handler)) => {
                handler(transaction.value());
                true
            }
            (TransactionKind::Request, ServiceHandler::Request(handler)) => {
                let reply = transaction.response(handler(transaction.value()));
                match reply.to_packet() {
                    Ok(packet) => self.link.write(packet),
                    Err(err) => {
                        tracing::error!(
                            service = transaction.service(),
                            error = %err,
                            "reply serialization failed"
                        );
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Gets if the link to the host is still up.
    pub fn connected(&self) -> bool {
        self.link.connected()
    }

    /// Disconnect, telling the host why.
    pub fn disconnect(&self, reason: &str) {
        self.link.disconnect(reason);
    }

    /// Close the link without notifying the host.
    pub fn close(&self) {
        self.link.close();
    }

    /// Number of requests still waiting for a reply. Entries persist until
    /// the reply arrives or the consumer is dropped.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Shared peer status: addresses, state, disconnect reason.
    pub fn status(&self) -> &std::sync::Arc<PeerStatus> {
        self.link.status()
    }

    /// The local socket address, as resolved at connect time.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.status().local_address().parse().ok()
    }
}
