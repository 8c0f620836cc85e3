//! Named service handlers and the registry that routes to them.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::transaction::validate_service;

/// Whether a service is advertised to remote peers.
///
/// Recorded at bind time and reportable, but never enforced on the wire:
/// routing treats public and private services identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// The callable bound under a service name.
///
/// The kind is part of the binding, so a message arriving for a
/// request-handling service (or vice versa) is a routing miss, not a
/// type confusion inside the handler.
pub enum ServiceHandler {
    /// Consumes the document, produces nothing.
    Message(Box<dyn Fn(&Value) + Send>),
    /// Consumes the document, produces the reply document.
    Request(Box<dyn Fn(&Value) -> Value + Send>),
}

impl ServiceHandler {
    /// Convenience constructor for a message handler.
    pub fn message(f: impl Fn(&Value) + Send + 'static) -> Self {
        ServiceHandler::Message(Box::new(f))
    }

    /// Convenience constructor for a request handler.
    pub fn request(f: impl Fn(&Value) -> Value + Send + 'static) -> Self {
        ServiceHandler::Request(Box::new(f))
    }
}

/// One bound service.
pub struct Service {
    visibility: Visibility,
    handler: ServiceHandler,
}

impl Service {
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn handler(&self) -> &ServiceHandler {
        &self.handler
    }
}

/// Name-keyed set of bound services. Binding is exclusive per name until
/// unbound.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler under a name.
    ///
    /// Fails if the name is invalid (non-ASCII, too long, reserved prefix)
    /// or already bound.
    pub fn bind(
        &mut self,
        name: impl Into<String>,
        visibility: Visibility,
        handler: ServiceHandler,
    ) -> Result<()> {
        let name = name.into();
        validate_service(&name)?;
        if self.services.contains_key(&name) {
            return Err(ServiceError::AlreadyBound(name));
        }
        self.services.insert(
            name,
            Service {
                visibility,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a binding, freeing the name for rebinding.
    pub fn unbind(&mut self, name: &str) -> Result<()> {
        self.services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotBound(name.to_string()))
    }

    /// Look up a binding by name.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Names of all public services.
    pub fn public_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, s)| s.visibility == Visibility::Public)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
