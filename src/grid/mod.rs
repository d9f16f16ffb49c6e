//! Grid nodes: competing consumers over shared command queues.
//!
//! Each node hosts an identical local dispatch pipe. Command consumers join
//! the shared group queue for their message type, so a published command is
//! processed by exactly one node; responses travel point-to-point to the
//! address named by the command, carrying its correlation id. The node never
//! re-publishes or re-dispatches an owned delivery, which is what keeps the
//! transport's single-ownership guarantee intact end-to-end.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{
    self, Binding, Dispatcher, DispatcherHandler, RedeliveryPolicy, Subscription, Transport,
};
use crate::config::{Config, NodeConfig, RedeliveryConfig};
use crate::context::{CancellationSource, MessageContext, Transform};
use crate::envelope::{Address, Envelope, MessageKind};
use crate::pipe::{Pipe, Stage, TransformStage};

pub mod consumer;
pub mod tally;

pub use consumer::{Consumer, ConsumerError};
pub use tally::DeliveryTally;

use consumer::{ConsumerDispatchStage, ErasedConsumer, TypedConsumer};

/// Settings applied to an outgoing publish.
#[derive(Debug, Default)]
pub struct PublishSettings {
    response_address: Option<Address>,
}

impl PublishSettings {
    /// Name the endpoint correlated responses should be delivered to.
    pub fn respond_to(mut self, address: Address) -> Self {
        self.response_address = Some(address);
        self
    }
}

/// Builder for a grid node.
pub struct GridNodeBuilder {
    transport: Arc<dyn Transport>,
    address: Address,
    node: NodeConfig,
    redelivery: RedeliveryConfig,
    stages: Vec<Arc<dyn Stage<MessageContext>>>,
    consumers: HashMap<TypeId, Arc<dyn ErasedConsumer>>,
}

impl GridNodeBuilder {
    /// Add a stage ahead of consumer dispatch. Stages run in the order they
    /// are added, on every delivery.
    pub fn stage<S: Stage<MessageContext> + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Add a transform for deliveries of `M`.
    pub fn transform<M, T>(self, transform: T) -> Self
    where
        M: Any + Send + Sync,
        T: Transform<M> + 'static,
    {
        self.stage(TransformStage::<M, _>::new(transform))
    }

    /// Register a consumer for commands of type `M`. The node joins the
    /// shared consumer group for `M` when built.
    pub fn consumer<M, C>(mut self, consumer: C) -> Self
    where
        M: Any + Send + Sync,
        C: Consumer<M> + 'static,
    {
        self.consumers.insert(
            TypeId::of::<M>(),
            Arc::new(TypedConsumer::<M, _>::new(consumer)),
        );
        self
    }

    /// Worker pool size per subscription.
    pub fn workers(mut self, workers: usize) -> Self {
        self.node.workers = workers.max(1);
        self
    }

    pub fn redelivery(mut self, config: RedeliveryConfig) -> Self {
        self.redelivery = config;
        self
    }

    /// Apply node and redelivery settings from a loaded configuration.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.node = config.node.clone();
        self.redelivery = config.redelivery.clone();
        self
    }

    /// Compose the pipe, subscribe every registered command type on its
    /// group queue, and start the node.
    pub async fn build(self) -> bus::Result<GridNode> {
        let shutdown = CancellationSource::new();

        let kinds: Vec<MessageKind> = self.consumers.values().map(|c| c.kind()).collect();

        let mut pipe = Pipe::builder();
        for stage in self.stages {
            pipe = pipe.stage_arc(stage);
        }
        let pipe = pipe.stage(ConsumerDispatchStage::new(self.consumers)).build();

        let dispatcher = Arc::new(Dispatcher::new(
            pipe,
            Arc::clone(&self.transport),
            self.address.clone(),
            shutdown.clone(),
            RedeliveryPolicy::new(&self.redelivery),
        ));

        let mut subscriptions = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            let binding = Binding::group(*kind).with_concurrency(self.node.workers);
            let subscription = self
                .transport
                .subscribe(binding, Box::new(DispatcherHandler::new(Arc::clone(&dispatcher))))
                .await?;
            subscriptions.push(subscription);
        }

        info!(
            node = %self.address,
            consumers = kinds.len(),
            workers = self.node.workers,
            "Grid node started"
        );

        Ok(GridNode {
            transport: self.transport,
            address: self.address,
            node: self.node,
            redelivery: self.redelivery,
            shutdown,
            subscriptions: Mutex::new(subscriptions),
        })
    }
}

/// One node of the grid.
pub struct GridNode {
    transport: Arc<dyn Transport>,
    address: Address,
    node: NodeConfig,
    redelivery: RedeliveryConfig,
    shutdown: CancellationSource,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl GridNode {
    pub fn builder(transport: Arc<dyn Transport>, address: Address) -> GridNodeBuilder {
        GridNodeBuilder {
            transport,
            address,
            node: NodeConfig::default(),
            redelivery: RedeliveryConfig::default(),
            stages: Vec::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a command. Correlation id uniqueness is the caller's
    /// precondition; this node only stamps itself as the source.
    pub async fn publish<M: Any + Send + Sync>(
        &self,
        message: M,
        correlation_id: Uuid,
    ) -> bus::Result<()> {
        self.publish_with(message, correlation_id, |settings| settings)
            .await
    }

    /// Publish a command with publish settings, e.g. a response address.
    pub async fn publish_with<M, F>(
        &self,
        message: M,
        correlation_id: Uuid,
        configure: F,
    ) -> bus::Result<()>
    where
        M: Any + Send + Sync,
        F: FnOnce(PublishSettings) -> PublishSettings,
    {
        let settings = configure(PublishSettings::default());

        let mut envelope = Envelope::new(message, correlation_id, self.address.clone());
        if let Some(response_address) = settings.response_address {
            envelope = envelope.with_response_address(response_address);
        }

        debug!(
            correlation_id = %correlation_id,
            message_type = envelope.kind().name(),
            "Publishing command"
        );
        self.transport.publish(envelope).await
    }

    /// Consume correlated responses of type `M` on this node's own endpoint.
    ///
    /// Responses arrive point-to-point at this node's address; they are run
    /// through a dedicated single-stage pipe so the consumer sees the same
    /// context surface as command consumers.
    pub async fn subscribe_responses<M, C>(&self, consumer: C) -> bus::Result<()>
    where
        M: Any + Send + Sync,
        C: Consumer<M> + 'static,
    {
        let mut consumers: HashMap<TypeId, Arc<dyn ErasedConsumer>> = HashMap::new();
        consumers.insert(
            TypeId::of::<M>(),
            Arc::new(TypedConsumer::<M, _>::new(consumer)),
        );

        let pipe = Pipe::builder()
            .stage(ConsumerDispatchStage::new(consumers))
            .build();
        let dispatcher = Arc::new(Dispatcher::new(
            pipe,
            Arc::clone(&self.transport),
            self.address.clone(),
            self.shutdown.clone(),
            RedeliveryPolicy::new(&self.redelivery),
        ));

        let binding = Binding::endpoint(MessageKind::of::<M>(), self.address.clone())
            .with_concurrency(self.node.workers);
        let subscription = self
            .transport
            .subscribe(binding, Box::new(DispatcherHandler::new(dispatcher)))
            .await?;

        self.subscriptions().push(subscription);
        Ok(())
    }

    /// Cancel in-flight pipeline runs, then drain this node's consumers.
    ///
    /// Contexts and their payload stores are released on every exit path:
    /// completion, fault, or the cancellation this triggers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let subscriptions: Vec<Subscription> = self.subscriptions().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe().await;
        }

        info!(node = %self.address, "Grid node stopped");
    }
}
