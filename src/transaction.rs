//! Application-level view of a packet: a service name, an authenticating
//! token and a JSON document.
//!
//! Transactions exist on the boundary between the connection engine (which
//! moves opaque packets) and the dispatch layer (which routes by service
//! name and hands handlers a parsed [`serde_json::Value`]). Field bounds are
//! validated at construction, so by the time a transaction is encoded the
//! fixed-width header fields are known to fit.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::protocol::{Opcode, Packet, SERVICE_SIZE, TOKEN_SIZE};

/// Reserved prefix for protocol control services.
const RESERVED_PREFIX: &str = "__";

/// What the sender expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Fire-and-forget; no reply is produced.
    Message,
    /// A call that expects a reply, or the reply itself. The two are
    /// distinguished only by which side is holding a pending entry for the
    /// sequence number.
    Request,
}

impl TransactionKind {
    fn opcode(self) -> Opcode {
        match self {
            TransactionKind::Message => Opcode::Message,
            TransactionKind::Request => Opcode::Request,
        }
    }
}

/// One routable unit of application traffic.
#[derive(Debug, Clone)]
pub struct Transaction {
    kind: TransactionKind,
    sequence: u16,
    token: String,
    service: String,
    value: Value,
}

impl Transaction {
    /// Create a fire-and-forget message.
    pub fn message(
        token: impl Into<String>,
        service: impl Into<String>,
        value: Value,
    ) -> Result<Self> {
        Self::create(TransactionKind::Message, token.into(), service.into(), value)
    }

    /// Create a request that expects a reply.
    pub fn request(
        token: impl Into<String>,
        service: impl Into<String>,
        value: Value,
    ) -> Result<Self> {
        Self::create(TransactionKind::Request, token.into(), service.into(), value)
    }

    fn create(
        kind: TransactionKind,
        token: String,
        service: String,
        value: Value,
    ) -> Result<Self> {
        validate_token(&token)?;
        validate_service(&service)?;
        Ok(Self {
            kind,
            sequence: 0,
            token,
            service,
            value,
        })
    }

    /// Parse an application packet. The payload must be a UTF-8 JSON
    /// document; anything else is a [`ServiceError::Json`], and the caller
    /// decides whether that costs the sender its connection.
    pub(crate) fn from_packet(packet: &Packet) -> Result<Self> {
        let kind = match packet.opcode() {
            Opcode::Message => TransactionKind::Message,
            Opcode::Request => TransactionKind::Request,
            Opcode::Internal => return Err(ServiceError::UnknownOpcode(Opcode::Internal as u8)),
        };
        let value: Value = serde_json::from_slice(packet.payload())?;
        Ok(Self {
            kind,
            sequence: packet.sequence(),
            token: packet.token().to_string(),
            service: packet.service().to_string(),
            value,
        })
    }

    /// Encode into a wire packet.
    pub(crate) fn to_packet(&self) -> Result<Packet> {
        let payload = serde_json::to_vec(&self.value)?;
        Ok(Packet::new(
            self.kind.opcode(),
            self.sequence,
            self.token.clone(),
            self.service.clone(),
            Bytes::from(payload),
        ))
    }

    /// Build the reply to this request: same sequence, service and token, so
    /// the caller's pending entry picks it up on arrival.
    pub fn response(&self, value: Value) -> Self {
        Self {
            kind: TransactionKind::Request,
            sequence: self.sequence,
            token: self.token.clone(),
            service: self.service.clone(),
            value,
        }
    }

    /// Stamp the correlation sequence. Drawn from the peer's counter before
    /// the write is enqueued, so a pending callback can be keyed first.
    pub(crate) fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    /// Gets the transaction kind.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Gets the correlation sequence number.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Gets the authenticating token ("" when unauthenticated).
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Gets the target service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Gets the JSON document.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

fn validate_token(token: &str) -> Result<()> {
    if !token.is_ascii() {
        return Err(ServiceError::NotAscii("token"));
    }
    if token.len() > TOKEN_SIZE {
        return Err(ServiceError::TokenTooLong(token.len()));
    }
    Ok(())
}

pub(crate) fn validate_service(service: &str) -> Result<()> {
    if !service.is_ascii() {
        return Err(ServiceError::NotAscii("service"));
    }
    if service.len() > SERVICE_SIZE {
        return Err(ServiceError::ServiceNameTooLong(service.len()));
    }
    if service.starts_with(RESERVED_PREFIX) {
        return Err(ServiceError::ReservedService(service.to_string()));
    }
    Ok(())
}
