//! Stage adapter applying a message transform inside a pipe run.
//!
//! The stage only engages when the context's message is the transform's
//! input type; any other delivery is forwarded untouched. Each engagement
//! builds a fresh `TransformContext` so transform-local payloads never leak
//! into the delivery context.

use std::any::{type_name, Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::{MessageContext, Transform, TransformContext, TransformResult};

use super::{Next, PipeError, Result, Stage};

/// Pipe stage running a [`Transform`] over matching deliveries.
pub struct TransformStage<M, T> {
    transform: T,
    _marker: PhantomData<fn() -> M>,
}

impl<M, T> TransformStage<M, T> {
    pub fn new(transform: T) -> Self {
        Self {
            transform,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<M, T> Stage<MessageContext> for TransformStage<M, T>
where
    M: Any + Send + Sync,
    T: Transform<M>,
{
    async fn handle(
        &self,
        ctx: &mut MessageContext,
        next: Next<'_, MessageContext>,
    ) -> Result<()> {
        if ctx.has_message_type(TypeId::of::<M>()) {
            let mut transform_ctx = TransformContext::<M>::derived_from(ctx);
            match self.transform.apply(&mut transform_ctx).await {
                Ok(TransformResult::Original(_)) => {
                    debug!(
                        message_type = type_name::<M>(),
                        "Transform returned original message"
                    );
                }
                Ok(TransformResult::Replaced(replacement)) => {
                    debug!(message_type = type_name::<M>(), "Transform replaced message");
                    ctx.replace_message(Arc::new(replacement));
                }
                Err(error) => {
                    return Err(PipeError::stage(
                        format!("transform<{}>", type_name::<M>()),
                        error,
                    ));
                }
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancellationToken, TransformError};
    use crate::envelope::{Address, Envelope};
    use crate::pipe::{Pipe, RunOutcome};
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct RawOrder {
        total: u64,
    }

    #[derive(Debug)]
    struct Unrelated;

    /// Doubles the order total.
    struct DoublingTransform;

    #[async_trait]
    impl Transform<RawOrder> for DoublingTransform {
        async fn apply(
            &self,
            ctx: &mut TransformContext<RawOrder>,
        ) -> std::result::Result<TransformResult<RawOrder>, TransformError> {
            let input = ctx.input()?;
            Ok(TransformResult::Replaced(RawOrder {
                total: input.total * 2,
            }))
        }
    }

    /// Always passes the input through.
    struct PassThroughTransform;

    #[async_trait]
    impl Transform<RawOrder> for PassThroughTransform {
        async fn apply(
            &self,
            ctx: &mut TransformContext<RawOrder>,
        ) -> std::result::Result<TransformResult<RawOrder>, TransformError> {
            ctx.return_original().await
        }
    }

    struct FaultingTransform;

    #[async_trait]
    impl Transform<RawOrder> for FaultingTransform {
        async fn apply(
            &self,
            _ctx: &mut TransformContext<RawOrder>,
        ) -> std::result::Result<TransformResult<RawOrder>, TransformError> {
            Err(TransformError::Failed("schema mismatch".to_string()))
        }
    }

    fn context_for<M: Any + Send + Sync>(message: M) -> MessageContext {
        let envelope = Envelope::new(message, Uuid::new_v4(), Address::new("node-a"));
        MessageContext::for_envelope(envelope, CancellationToken::none())
    }

    #[tokio::test]
    async fn test_replaced_message_is_swapped_into_context() {
        let pipe = Pipe::builder()
            .stage(TransformStage::<RawOrder, _>::new(DoublingTransform))
            .build();
        let mut ctx = context_for(RawOrder { total: 21 });

        assert!(pipe.execute(&mut ctx).await.is_completed());

        let message = ctx.try_get_message::<RawOrder>().unwrap();
        assert_eq!(message.total, 42);
    }

    #[tokio::test]
    async fn test_pass_through_leaves_message_untouched() {
        let pipe = Pipe::builder()
            .stage(TransformStage::<RawOrder, _>::new(PassThroughTransform))
            .build();
        let mut ctx = context_for(RawOrder { total: 7 });
        let before = ctx.try_get_message::<RawOrder>().unwrap();

        assert!(pipe.execute(&mut ctx).await.is_completed());

        let after = ctx.try_get_message::<RawOrder>().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_non_matching_delivery_is_forwarded() {
        let pipe = Pipe::builder()
            .stage(TransformStage::<RawOrder, _>::new(DoublingTransform))
            .build();
        let mut ctx = context_for(Unrelated);

        assert!(pipe.execute(&mut ctx).await.is_completed());
        assert!(ctx.try_get_message::<Unrelated>().is_some());
    }

    #[tokio::test]
    async fn test_transform_fault_becomes_stage_fault() {
        let pipe = Pipe::builder()
            .stage(TransformStage::<RawOrder, _>::new(FaultingTransform))
            .build();
        let mut ctx = context_for(RawOrder { total: 1 });

        match pipe.execute(&mut ctx).await {
            RunOutcome::Faulted(PipeError::Stage { stage, .. }) => {
                assert!(stage.contains("transform"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }
}
