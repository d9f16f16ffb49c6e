//! Command envelopes and endpoint addressing.
//!
//! An envelope wraps one published message with the headers the delivery
//! layer needs: the producer-supplied correlation id, the source address,
//! and an optional response address. Headers are written by the transport
//! layer only; pipeline stages see them read-only.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Logical address of an endpoint on the message fabric.
///
/// Addresses name queues: a node's own endpoint queue, or the shared
/// consumer-group queue for a message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Create an address from a queue name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identity of a message type on the fabric: its `TypeId` for routing and
/// its type name for introspection and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKind {
    type_id: TypeId,
    name: &'static str,
}

impl MessageKind {
    /// The kind of a concrete message type.
    pub fn of<M: Any + Send + Sync>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: type_name::<M>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A published message together with its delivery headers.
///
/// Envelopes are constructed by the publish path and are immutable once on
/// the fabric. Correlation id uniqueness is a precondition supplied by the
/// producer; the delivery layer preserves it but never invents it.
#[derive(Clone)]
pub struct Envelope {
    correlation_id: Uuid,
    source_address: Address,
    response_address: Option<Address>,
    sent_at: DateTime<Utc>,
    kind: MessageKind,
    message: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    pub(crate) fn new<M: Any + Send + Sync>(
        message: M,
        correlation_id: Uuid,
        source_address: Address,
    ) -> Self {
        Self {
            correlation_id,
            source_address,
            response_address: None,
            sent_at: Utc::now(),
            kind: MessageKind::of::<M>(),
            message: Arc::new(message),
        }
    }

    /// Build an envelope from an already type-erased message (response path).
    pub(crate) fn from_parts(
        kind: MessageKind,
        message: Arc<dyn Any + Send + Sync>,
        correlation_id: Uuid,
        source_address: Address,
        response_address: Option<Address>,
    ) -> Self {
        Self {
            correlation_id,
            source_address,
            response_address,
            sent_at: Utc::now(),
            kind,
            message,
        }
    }

    pub(crate) fn with_response_address(mut self, address: Address) -> Self {
        self.response_address = Some(address);
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn source_address(&self) -> &Address {
        &self.source_address
    }

    pub fn response_address(&self) -> Option<&Address> {
        self.response_address.as_ref()
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub(crate) fn message(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.message
    }

    /// Downcast the payload to a concrete message type.
    pub fn message_as<M: Any + Send + Sync>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.message).downcast::<M>().ok()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("correlation_id", &self.correlation_id)
            .field("message_type", &self.kind.name())
            .field("source_address", &self.source_address)
            .field("response_address", &self.response_address)
            .field("sent_at", &self.sent_at)
            .finish_non_exhaustive()
    }
}
