//! Transform contexts: one input message becoming one result.
//!
//! A transform invocation gets its own context (same envelope headers and
//! cancellation token as the delivery that spawned it, but its own payload
//! store) plus a typed input fixed at construction. Exactly one of
//! returning the original, producing a replacement, or faulting terminates
//! an invocation.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use super::{CancellationToken, MessageContext, PayloadStore, PipeContext};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// `return_original` was called on a context without input. Programmer
    /// error; nothing was mutated.
    #[error("transform context has no input message")]
    MissingInput,

    #[error("transform failed: {0}")]
    Failed(String),
}

/// Terminal result of a transform invocation.
#[derive(Debug)]
pub enum TransformResult<M> {
    /// The input forwarded unchanged (pass-through).
    Original(Arc<M>),
    /// A newly produced value replacing the input.
    Replaced(M),
}

impl<M> TransformResult<M> {
    pub fn is_original(&self) -> bool {
        matches!(self, Self::Original(_))
    }

    pub fn value(&self) -> &M {
        match self {
            Self::Original(original) => original,
            Self::Replaced(replacement) => replacement,
        }
    }
}

/// Context for a single transform of a `M` input.
///
/// `has_input` is fixed at construction and never changes; the context is
/// logically single-use.
pub struct TransformContext<M> {
    base: MessageContext,
    input: Option<Arc<M>>,
}

impl<M: Any + Send + Sync> TransformContext<M> {
    /// Wrap a message context; the input is its message when the concrete
    /// type matches, absent otherwise.
    pub fn new(base: MessageContext) -> Self {
        let input = base.try_get_message::<M>();
        Self { base, input }
    }

    /// Derive a transform context from a live delivery context: same headers
    /// and cancellation token, fresh payload store.
    pub(crate) fn derived_from(parent: &MessageContext) -> Self {
        let base = MessageContext {
            envelope: parent.envelope.clone(),
            message: parent.message.clone(),
            kind: parent.kind,
            payloads: PayloadStore::new(),
            cancellation: parent.cancellation.clone(),
        };
        Self::new(base)
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn input(&self) -> Result<&Arc<M>, TransformError> {
        self.input.as_ref().ok_or(TransformError::MissingInput)
    }

    /// Produce the pass-through result wrapping the input unchanged.
    ///
    /// Calling this without input is a precondition violation and surfaces
    /// [`TransformError::MissingInput`]; no state is touched.
    pub async fn return_original(&self) -> Result<TransformResult<M>, TransformError> {
        match &self.input {
            Some(input) => Ok(TransformResult::Original(Arc::clone(input))),
            None => Err(TransformError::MissingInput),
        }
    }
}

impl<M> Deref for TransformContext<M> {
    type Target = MessageContext;

    fn deref(&self) -> &MessageContext {
        &self.base
    }
}

impl<M: Any + Send + Sync> PipeContext for TransformContext<M> {
    fn payloads(&self) -> &PayloadStore {
        self.base.payloads()
    }

    fn cancellation(&self) -> &CancellationToken {
        self.base.cancellation()
    }
}

/// A message transform applied by a pipe stage.
#[async_trait]
pub trait Transform<M: Any + Send + Sync>: Send + Sync {
    async fn apply(&self, ctx: &mut TransformContext<M>)
        -> Result<TransformResult<M>, TransformError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Address, Envelope};
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct Order {
        total: u64,
    }

    #[derive(Debug)]
    struct Unrelated;

    fn delivery_context<M: Any + Send + Sync>(message: M) -> MessageContext {
        let envelope = Envelope::new(message, Uuid::new_v4(), Address::new("node-a"));
        MessageContext::for_envelope(envelope, CancellationToken::none())
    }

    #[tokio::test]
    async fn test_return_original_is_pass_through() {
        let ctx = TransformContext::<Order>::new(delivery_context(Order { total: 12 }));
        assert!(ctx.has_input());

        let result = ctx.return_original().await.unwrap();

        assert!(result.is_original());
        let input = ctx.input().unwrap();
        match &result {
            TransformResult::Original(original) => assert!(Arc::ptr_eq(original, input)),
            TransformResult::Replaced(_) => panic!("pass-through must not replace"),
        }
    }

    #[tokio::test]
    async fn test_return_original_without_input_is_precondition_failure() {
        let ctx = TransformContext::<Order>::new(delivery_context(Unrelated));
        assert!(!ctx.has_input());

        let error = ctx.return_original().await.unwrap_err();

        assert!(matches!(error, TransformError::MissingInput));
        // No side effects: payload store untouched, input still absent.
        assert!(ctx.payloads().is_empty());
        assert!(!ctx.has_input());
    }

    #[tokio::test]
    async fn test_input_fixed_at_construction() {
        let ctx = TransformContext::<Order>::new(delivery_context(Order { total: 3 }));

        assert!(ctx.has_input());
        assert_eq!(ctx.input().unwrap().total, 3);
        // Repeated calls observe the same input.
        assert!(Arc::ptr_eq(ctx.input().unwrap(), ctx.input().unwrap()));
    }

    #[tokio::test]
    async fn test_derived_context_has_own_payload_store() {
        let parent = delivery_context(Order { total: 1 });
        parent.get_or_add_payload(|| "parent-only".to_string());

        let derived = TransformContext::<Order>::derived_from(&parent);

        assert!(!derived.has_payload::<String>());
        assert_eq!(derived.correlation_id(), parent.correlation_id());
    }

    #[test]
    fn test_result_value_access() {
        let original = TransformResult::Original(Arc::new(Order { total: 8 }));
        let replaced = TransformResult::Replaced(Order { total: 9 });

        assert_eq!(original.value().total, 8);
        assert_eq!(replaced.value().total, 9);
        assert!(!replaced.is_original());
    }
}
