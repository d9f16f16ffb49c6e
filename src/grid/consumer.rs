//! Typed consumers and the dispatch stage that routes deliveries to them.
//!
//! Consumers are registered per concrete message type and erased behind a
//! registry keyed by `TypeId`, so one node pipe serves any number of
//! message types.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::context::MessageContext;
use crate::envelope::MessageKind;
use crate::pipe::{Next, PipeError, Stage};

/// Errors a consumer can surface; they fault the pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer failed: {0}")]
    Failed(String),
}

/// Processes messages of one concrete type delivered to a grid node.
#[async_trait]
pub trait Consumer<M: Any + Send + Sync>: Send + Sync {
    async fn consume(
        &self,
        message: Arc<M>,
        ctx: &mut MessageContext,
    ) -> Result<(), ConsumerError>;
}

/// Object-safe view of a typed consumer.
pub(crate) trait ErasedConsumer: Send + Sync {
    fn kind(&self) -> MessageKind;

    fn consume<'a>(
        &'a self,
        ctx: &'a mut MessageContext,
    ) -> BoxFuture<'a, Result<(), ConsumerError>>;
}

/// Bridges a typed `Consumer<M>` into the erased registry.
pub(crate) struct TypedConsumer<M, C> {
    consumer: C,
    _marker: PhantomData<fn() -> M>,
}

impl<M, C> TypedConsumer<M, C> {
    pub(crate) fn new(consumer: C) -> Self {
        Self {
            consumer,
            _marker: PhantomData,
        }
    }
}

impl<M, C> ErasedConsumer for TypedConsumer<M, C>
where
    M: Any + Send + Sync,
    C: Consumer<M>,
{
    fn kind(&self) -> MessageKind {
        MessageKind::of::<M>()
    }

    fn consume<'a>(
        &'a self,
        ctx: &'a mut MessageContext,
    ) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(async move {
            let Some(message) = ctx.try_get_message::<M>() else {
                return Err(ConsumerError::Failed(format!(
                    "delivery does not carry a {}",
                    MessageKind::of::<M>().name()
                )));
            };
            self.consumer.consume(message, ctx).await
        })
    }
}

/// Terminal pipe stage routing each delivery to its registered consumer.
///
/// A delivery with no registered consumer is skipped (logged, not faulted):
/// the node simply has no interest in that type.
pub(crate) struct ConsumerDispatchStage {
    consumers: HashMap<TypeId, Arc<dyn ErasedConsumer>>,
}

impl ConsumerDispatchStage {
    pub(crate) fn new(consumers: HashMap<TypeId, Arc<dyn ErasedConsumer>>) -> Self {
        Self { consumers }
    }
}

#[async_trait]
impl Stage<MessageContext> for ConsumerDispatchStage {
    async fn handle(
        &self,
        ctx: &mut MessageContext,
        next: Next<'_, MessageContext>,
    ) -> crate::pipe::Result<()> {
        let consumer = ctx
            .message_type_id()
            .and_then(|type_id| self.consumers.get(&type_id));

        match consumer {
            Some(consumer) => {
                let kind = consumer.kind();
                consumer
                    .consume(ctx)
                    .await
                    .map_err(|error| PipeError::stage(kind.name(), error))?;
            }
            None => {
                warn!(
                    message_types = ?ctx.supported_message_types(),
                    "No consumer registered for delivered message"
                );
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancellationToken;
    use crate::envelope::{Address, Envelope};
    use crate::pipe::{Pipe, RunOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Debug)]
    struct Ping(u64);

    #[derive(Debug)]
    struct Pong;

    struct CountingConsumer {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Consumer<Ping> for CountingConsumer {
        async fn consume(
            &self,
            message: Arc<Ping>,
            _ctx: &mut MessageContext,
        ) -> Result<(), ConsumerError> {
            assert_eq!(message.0, 7);
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingConsumer;

    #[async_trait]
    impl Consumer<Ping> for RejectingConsumer {
        async fn consume(
            &self,
            _message: Arc<Ping>,
            _ctx: &mut MessageContext,
        ) -> Result<(), ConsumerError> {
            Err(ConsumerError::Failed("not today".to_string()))
        }
    }

    fn registry_of<C: Consumer<Ping> + 'static>(
        consumer: C,
    ) -> HashMap<TypeId, Arc<dyn ErasedConsumer>> {
        let mut consumers: HashMap<TypeId, Arc<dyn ErasedConsumer>> = HashMap::new();
        consumers.insert(
            TypeId::of::<Ping>(),
            Arc::new(TypedConsumer::<Ping, _>::new(consumer)),
        );
        consumers
    }

    fn context_for<M: Any + Send + Sync>(message: M) -> MessageContext {
        let envelope = Envelope::new(message, Uuid::new_v4(), Address::new("node-a"));
        MessageContext::for_envelope(envelope, CancellationToken::none())
    }

    #[tokio::test]
    async fn test_matching_consumer_is_invoked() {
        let count = Arc::new(AtomicUsize::new(0));
        let pipe = Pipe::builder()
            .stage(ConsumerDispatchStage::new(registry_of(CountingConsumer {
                count: Arc::clone(&count),
            })))
            .build();

        let mut ctx = context_for(Ping(7));
        assert!(pipe.execute(&mut ctx).await.is_completed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let pipe = Pipe::builder()
            .stage(ConsumerDispatchStage::new(registry_of(CountingConsumer {
                count: Arc::clone(&count),
            })))
            .build();

        let mut ctx = context_for(Pong);
        assert!(pipe.execute(&mut ctx).await.is_completed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_consumer_error_faults_the_run() {
        let pipe = Pipe::builder()
            .stage(ConsumerDispatchStage::new(registry_of(RejectingConsumer)))
            .build();

        let mut ctx = context_for(Ping(7));
        match pipe.execute(&mut ctx).await {
            RunOutcome::Faulted(PipeError::Stage { stage, .. }) => {
                assert_eq!(stage, MessageKind::of::<Ping>().name());
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }
}
