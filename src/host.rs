//! The serving node: accepts consumers, routes their traffic to bound
//! services, and answers requests.
//!
//! A host is polled, not callback-driven: each [`Host::poll`] call drains
//! every live connection's inbound queue, dispatches by service name, writes
//! request replies, applies the configured misbehavior policy, and sweeps
//! disconnected links out of the connection set. All of that happens under
//! one pass over the connection set, so handlers observe a consistent view.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::net::ToSocketAddrs;

use crate::error::Result;
use crate::link::Link;
use crate::server::{lock_connections, ConnectionSet, Server};
use crate::service::{ServiceHandler, ServiceRegistry, Visibility};
use crate::transaction::{Transaction, TransactionKind};

/// Policy knobs for misbehaving consumers.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// Disconnect a consumer that targets a service with no matching
    /// binding. Reason: "Service not found".
    pub kick_on_unknown_service: bool,
    /// Disconnect a consumer whose payload is not valid JSON. Reason:
    /// "Malformed or invalid JSON".
    pub kick_on_malformed_json: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kick_on_unknown_service: true,
            kick_on_malformed_json: true,
        }
    }
}

/// A listening node with a service registry.
pub struct Host {
    server: Server,
    connections: ConnectionSet,
    registry: ServiceRegistry,
    config: HostConfig,
}

impl Host {
    /// Bind a listener and start accepting consumers immediately. Accepted
    /// connections exchange keep-alives on their own; traffic waits in their
    /// queues until the first poll.
    pub async fn bind(addr: impl ToSocketAddrs, config: HostConfig) -> Result<Host> {
        let (mut server, listener) = Server::bind(addr).await?;
        server.start(listener);
        let connections = server.connections();
        Ok(Host {
            server,
            connections,
            registry: ServiceRegistry::new(),
            config,
        })
    }

    /// Bind a fire-and-forget message handler.
    pub fn bind_message(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        handler: impl Fn(&Value) + Send + 'static,
    ) -> Result<()> {
        self.registry
            .bind(name, visibility, ServiceHandler::message(handler))
    }

    /// Bind a request handler; its return value travels back as the reply.
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

    /// Drain and dispatch all queued inbound traffic, then sweep
    /// disconnected links. Returns the number of transactions dispatched to
    /// a handler.
    pub fn poll(&mut self) -> usize {
        let mut dispatched = 0;
        let mut links = lock_connections(&self.connections);

        for link in links.iter_mut() {
            while let Some(packet) = link.read() {
                let transaction = match Transaction::from_packet(&packet) {
                    Ok(transaction) => transaction,
                    Err(err) => {
                        tracing::warn!(
                            remote = %link.status().remote_address(),
                            service = packet.service(),
                            error = %err,
                            "undecodable transaction"
                        );
                        if self.config.kick_on_malformed_json {
                            link.disconnect("Malformed or invalid JSON");
                            break;
                        }
                        continue;
                    }
                };

                if dispatch(&self.registry, link, &transaction) {
                    dispatched += 1;
                } else {
                    tracing::debug!(
                        remote = %link.status().remote_address(),
                        service = transaction.service(),
                        "no matching service"
                    );
                    if self.config.kick_on_unknown_service {
                        link.disconnect("Service not found");
                        break;
                    }
                }
            }
        }

        links.retain(Link::connected);
        dispatched
    }

    /// Send a fire-and-forget message to every live consumer, targeting a
    /// service bound on their side. Returns the number of links written.
    pub fn broadcast(&self, service: impl Into<String>, value: Value) -> Result<usize> {
        let transaction = Transaction::message("", service, value)?;
        let packet = transaction.to_packet()?;

        let links = lock_connections(&self.connections);
        let mut written = 0;
        for link in links.iter().filter(|link| link.connected()) {
            link.write(packet.clone());
            written += 1;
        }
        Ok(written)
    }

    /// Stop accepting new consumers. Live connections are unaffected.
    pub fn stop(&mut self) {
        self.server.stop();
    }

    /// The resolved listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Number of links currently in the connection set. Includes links that
    /// disconnected since the last poll but have not been swept yet.
    pub fn connection_count(&self) -> usize {
        lock_connections(&self.connections).len()
    }

    /// Names of the public services currently bound.
    pub fn public_services(&self) -> Vec<String> {
        self.registry
            .public_services()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// Route one transaction. Returns false on a routing miss, which includes a
/// kind mismatch between the transaction and the bound handler.
fn dispatch(registry: &ServiceRegistry, link: &Link, transaction: &Transaction) -> bool {
    let Some(service) = registry.get(transaction.service()) else {
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
                Ok(packet) => link.write(packet),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, Opcode, Packet};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn poll_until(host: &mut Host, want: usize) -> usize {
        let mut total = 0;
        for _ in 0..200 {
            total += host.poll();
            if total >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        total
    }

    async fn wait_connections(host: &Host, want: usize) {
        for _ in 0..200 {
            if host.connection_count() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {want} connections, saw {}", host.connection_count());
    }

    fn json_packet(opcode: Opcode, sequence: u16, service: &str, value: &Value) -> Vec<u8> {
        Packet::new(
            opcode,
            sequence,
            "",
            service,
            Bytes::from(serde_json::to_vec(value).unwrap()),
        )
        .encode()
    }

    /// Read frames from a raw socket until a non-Internal packet arrives.
    async fn next_application_packet(stream: &mut TcpStream) -> Option<Packet> {
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            for packet in frames.push(&buf[..n]).ok()? {
                if packet.opcode() != Opcode::Internal {
                    return Some(packet);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_message_dispatch() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();
        host.bind_message("Ping", Visibility::Public, move |v| {
            assert_eq!(v, &json!({"n": 1}));
            calls_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        client
            .write_all(&json_packet(Opcode::Message, 0, "Ping", &json!({"n": 1})))
            .await
            .unwrap();

        assert_eq!(poll_until(&mut host, 1).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_request_gets_correlated_reply() {
        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();
        host.bind_request("Add", Visibility::Public, |v| {
            json!({"sum": v["a"].as_i64().unwrap() + v["b"].as_i64().unwrap()})
        })
        .unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        client
            .write_all(&json_packet(Opcode::Request, 17, "Add", &json!({"a": 2, "b": 5})))
            .await
            .unwrap();

        poll_until(&mut host, 1).await;

        let reply = next_application_packet(&mut client).await.unwrap();
        assert_eq!(reply.opcode(), Opcode::Request);
        assert_eq!(reply.sequence(), 17);
        assert_eq!(reply.service(), "Add");
        let value: Value = serde_json::from_slice(reply.payload()).unwrap();
        assert_eq!(value, json!({"sum": 7}));
    }

    #[tokio::test]
    async fn test_unknown_service_kicks_by_default() {
        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        wait_connections(&host, 1).await;
        client
            .write_all(&json_packet(Opcode::Message, 0, "Nope", &json!({})))
            .await
            .unwrap();

        for _ in 0..200 {
            host.poll();
            if host.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_tolerated_when_configured() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let config = HostConfig {
            kick_on_unknown_service: false,
            ..HostConfig::default()
        };
        let mut host = Host::bind("127.0.0.1:0", config).await.unwrap();
        host.bind_message("Real", Visibility::Public, move |_| {
            calls_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        client
            .write_all(&json_packet(Opcode::Message, 0, "Nope", &json!({})))
            .await
            .unwrap();
        client
            .write_all(&json_packet(Opcode::Message, 0, "Real", &json!({})))
            .await
            .unwrap();

        assert_eq!(poll_until(&mut host, 1).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_kicks_by_default() {
        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();
        host.bind_message("Echo", Visibility::Public, |_| {}).unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        wait_connections(&host, 1).await;
        let bad = Packet::new(
            Opcode::Message,
            0,
            "",
            "Echo",
            Bytes::from_static(b"{broken"),
        );
        client.write_all(&bad.encode()).await.unwrap();

        for _ in 0..200 {
            host.poll();
            if host.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_tolerated_when_configured() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let config = HostConfig {
            kick_on_malformed_json: false,
            ..HostConfig::default()
        };
        let mut host = Host::bind("127.0.0.1:0", config).await.unwrap();
        host.bind_message("Echo", Visibility::Public, move |_| {
            calls_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        let bad = Packet::new(
            Opcode::Message,
            0,
            "",
            "Echo",
            Bytes::from_static(b"{broken"),
        );
        client.write_all(&bad.encode()).await.unwrap();
        client
            .write_all(&json_packet(Opcode::Message, 0, "Echo", &json!({})))
            .await
            .unwrap();

        assert_eq!(poll_until(&mut host, 1).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_unknown_service() {
        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();
        host.bind_message("OneWay", Visibility::Public, |_| {}).unwrap();

        let mut client = TcpStream::connect(host.local_addr()).await.unwrap();
        wait_connections(&host, 1).await;
        // Request opcode at a message-only binding
        client
            .write_all(&json_packet(Opcode::Request, 1, "OneWay", &json!({})))
            .await
            .unwrap();

        for _ in 0..200 {
            host.poll();
            if host.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unbind_then_rebind() {
        let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await.unwrap();
        host.bind_message("Echo", Visibility::Public, |_| {}).unwrap();
        host.unbind("Echo").unwrap();
        assert!(host.bind_request("Echo", Visibility::Private, |v| v.clone()).is_ok());
        assert!(host.public_services().is_empty());
    }
}
