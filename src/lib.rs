//! Lightweight peer-to-peer messaging and RPC over TCP.
//!
//! Two node roles share one substrate: a [`Host`] listens and serves named
//! services, a [`Consumer`] connects and calls them. Traffic is framed with
//! a fixed 96-byte binary header and carries JSON documents; every
//! connection runs its own background engine that handles keep-alive
//! liveness and the disconnect handshake, so application code only ever
//! binds handlers and polls.
//!
//! ```text
//! Consumer ──request "Add" {a,b}──► Host ──► bound handler
//! Consumer ◄──reply {sum} (same sequence)◄── Host
//! ```
//!
//! # Example
//!
//! ```no_run
//! use simpleservice::{Consumer, Host, HostConfig, Visibility};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), simpleservice::ServiceError> {
//! let mut host = Host::bind("127.0.0.1:0", HostConfig::default()).await?;
//! host.bind_request("Add", Visibility::Public, |v| {
//!     json!({"sum": v["a"].as_i64().unwrap_or(0) + v["b"].as_i64().unwrap_or(0)})
//! })?;
//!
//! let mut consumer = Consumer::connect(host.local_addr()).await?;
//! consumer.request("Add", json!({"a": 2, "b": 3}), |reply| {
//!     println!("sum = {}", reply["sum"]);
//! })?;
//!
//! loop {
//!     host.poll();
//!     if consumer.poll() > 0 {
//!         break;
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod error;
pub mod host;
pub mod link;
pub mod peer;
pub mod protocol;
pub mod service;
pub mod transaction;

mod server;

pub use consumer::Consumer;
pub use error::{Result, ServiceError};
pub use host::{Host, HostConfig};
pub use link::{Link, KEEP_ALIVE_DELAY, KEEP_ALIVE_WAIT};
pub use peer::{PeerState, PeerStatus};
pub use protocol::{Header, Opcode, Packet};
pub use service::{ServiceHandler, ServiceRegistry, Visibility};
pub use transaction::{Transaction, TransactionKind};
