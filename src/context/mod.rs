//! Pipeline contexts.
//!
//! This module contains:
//! - `MessageContext`: per-delivery carrier of the message, its payloads,
//!   and the run's cancellation token
//! - `TransformContext<M>`: specialization for in-flight transforms
//! - `PayloadStore`: type-indexed payload container
//! - Cancellation primitives (`CancellationSource`, `CancellationToken`)
//!
//! Capabilities are layered by composition, not inheritance: the
//! [`PipeContext`] trait is the capability set every stage can rely on,
//! independent of the concrete context kind.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod cancellation;
pub mod payload;
pub mod transform;

pub use cancellation::{CancellationSource, CancellationToken};
pub use payload::PayloadStore;
pub use transform::{Transform, TransformContext, TransformError, TransformResult};

use crate::envelope::{Address, Envelope, MessageKind};

/// Capability set shared by every pipeline context: payload access and
/// cooperative cancellation.
pub trait PipeContext: Send {
    fn payloads(&self) -> &PayloadStore;
    fn cancellation(&self) -> &CancellationToken;
}

/// Per-delivery context flowing through a dispatch pipe.
///
/// Wraps the inbound envelope together with an exclusively-owned payload
/// store and the run's cancellation token. The underlying message may be
/// absent (for example after a transform consumed it); lookup is total.
pub struct MessageContext {
    envelope: Envelope,
    message: Option<Arc<dyn Any + Send + Sync>>,
    kind: Option<MessageKind>,
    payloads: PayloadStore,
    cancellation: CancellationToken,
}

impl MessageContext {
    /// Build the context for one inbound delivery.
    pub fn for_envelope(envelope: Envelope, cancellation: CancellationToken) -> Self {
        let message = Some(Arc::clone(envelope.message()));
        let kind = Some(envelope.kind());
        Self {
            envelope,
            message,
            kind,
            payloads: PayloadStore::new(),
            cancellation,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn correlation_id(&self) -> uuid::Uuid {
        self.envelope.correlation_id()
    }

    pub fn source_address(&self) -> &Address {
        self.envelope.source_address()
    }

    pub fn response_address(&self) -> Option<&Address> {
        self.envelope.response_address()
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    pub fn message_type_id(&self) -> Option<TypeId> {
        self.kind.map(|kind| kind.type_id())
    }

    /// Type names the underlying message satisfies. Introspection is nominal:
    /// a message satisfies exactly its concrete type.
    pub fn supported_message_types(&self) -> Vec<&'static str> {
        self.kind.map(|kind| kind.name()).into_iter().collect()
    }

    /// Structural check, consistent with [`supported_message_types`](Self::supported_message_types).
    pub fn has_message_type(&self, message_type: TypeId) -> bool {
        self.kind
            .is_some_and(|kind| kind.type_id() == message_type)
    }

    pub fn has_message_named(&self, name: &str) -> bool {
        self.kind.is_some_and(|kind| kind.name() == name)
    }

    /// Retrieve the message as a concrete type. Succeeds iff the message is
    /// present and `M` is its concrete type; absence is `None`, never an error.
    pub fn try_get_message<M: Any + Send + Sync>(&self) -> Option<Arc<M>> {
        self.message
            .as_ref()
            .and_then(|message| Arc::clone(message).downcast::<M>().ok())
    }

    /// Take the message out of the context, leaving it absent. Used by
    /// terminal stages that consume the message outright.
    pub fn take_message(&mut self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.kind = None;
        self.message.take()
    }

    pub(crate) fn replace_message<M: Any + Send + Sync>(&mut self, message: Arc<M>) {
        self.kind = Some(MessageKind::of::<M>());
        self.message = Some(message);
    }

    /// The payload store exclusively owned by this context.
    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    /// The run's cancellation signal. Observe-only: the pipeline driver owns
    /// the source.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    // Payload store delegation.

    pub fn has_payload<T: Any + Send + Sync>(&self) -> bool {
        self.payloads.has_payload::<T>()
    }

    pub fn has_payload_type(&self, payload_type: TypeId) -> bool {
        self.payloads.has_payload_type(payload_type)
    }

    pub fn try_get_payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payloads.try_get_payload::<T>()
    }

    pub fn get_or_add_payload<T, F>(&self, factory: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.payloads.get_or_add_payload(factory)
    }

    pub fn try_get_or_add_payload<T, E, F>(&self, factory: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        self.payloads.try_get_or_add_payload(factory)
    }

    /// Queue a correlated response. The dispatcher drains the buffer after
    /// the run completes and forwards each entry to the command's response
    /// address with the inbound correlation id.
    pub fn respond<M: Any + Send + Sync>(&self, message: M) {
        let buffer = self.get_or_add_payload(ResponseBuffer::default);
        buffer.push(MessageKind::of::<M>(), Arc::new(message));
    }
}

impl PipeContext for MessageContext {
    fn payloads(&self) -> &PayloadStore {
        MessageContext::payloads(self)
    }

    fn cancellation(&self) -> &CancellationToken {
        MessageContext::cancellation(self)
    }
}

/// Responses queued by consumers during a pipeline run.
///
/// Lives in the payload store of the run's context; drained exactly once by
/// the dispatcher on the success path.
#[derive(Default)]
pub struct ResponseBuffer {
    pending: Mutex<Vec<OutgoingResponse>>,
}

pub(crate) struct OutgoingResponse {
    pub(crate) kind: MessageKind,
    pub(crate) message: Arc<dyn Any + Send + Sync>,
}

impl ResponseBuffer {
    fn pending(&self) -> MutexGuard<'_, Vec<OutgoingResponse>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, kind: MessageKind, message: Arc<dyn Any + Send + Sync>) {
        self.pending().push(OutgoingResponse { kind, message });
    }

    pub(crate) fn drain(&self) -> Vec<OutgoingResponse> {
        std::mem::take(&mut *self.pending())
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct Ping(u64);

    #[derive(Debug)]
    struct Pong;

    fn context_for(message: Ping) -> MessageContext {
        let envelope = Envelope::new(message, Uuid::new_v4(), Address::new("node-a"));
        MessageContext::for_envelope(envelope, CancellationToken::none())
    }

    #[test]
    fn test_introspection_matches_concrete_type() {
        let ctx = context_for(Ping(1));

        assert!(ctx.has_message());
        assert!(ctx.has_message_type(TypeId::of::<Ping>()));
        assert!(!ctx.has_message_type(TypeId::of::<Pong>()));
        assert_eq!(
            ctx.supported_message_types(),
            vec![std::any::type_name::<Ping>()]
        );
        assert!(ctx.has_message_named(std::any::type_name::<Ping>()));
    }

    #[test]
    fn test_try_get_message_is_total() {
        let ctx = context_for(Ping(5));

        assert_eq!(*ctx.try_get_message::<Ping>().unwrap(), Ping(5));
        assert!(ctx.try_get_message::<Pong>().is_none());
    }

    #[test]
    fn test_take_message_leaves_context_absent() {
        let mut ctx = context_for(Ping(5));

        assert!(ctx.take_message().is_some());

        assert!(!ctx.has_message());
        assert!(ctx.try_get_message::<Ping>().is_none());
        assert!(ctx.supported_message_types().is_empty());
        // Headers survive the message.
        assert_eq!(ctx.source_address(), &Address::new("node-a"));
    }

    #[test]
    fn test_payload_delegation() {
        let ctx = context_for(Ping(1));

        let first = ctx.get_or_add_payload(|| "session".to_string());
        let second = ctx.get_or_add_payload(|| "other".to_string());

        assert!(Arc::ptr_eq(&first, &second));
        assert!(ctx.has_payload::<String>());
    }

    #[test]
    fn test_respond_accumulates_in_buffer() {
        let ctx = context_for(Ping(1));

        ctx.respond(Pong);
        ctx.respond(Pong);

        let buffer = ctx.try_get_payload::<ResponseBuffer>().unwrap();
        assert_eq!(buffer.len(), 2);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, MessageKind::of::<Pong>());
        assert!(buffer.is_empty());
    }
}
