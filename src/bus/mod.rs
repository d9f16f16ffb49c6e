//! Message transport and local dispatch.
//!
//! This module contains:
//! - `Transport` trait: the publish/subscribe fabric grid nodes consume
//! - `ChannelTransport`: deterministic in-memory implementation
//! - `LossyTransport`: wrapper that drops publishes for loss testing
//! - `Dispatcher`: the local dispatch entry point running a node's pipe
//!
//! Delivery semantics: a publish places one copy of the envelope on every
//! queue bound to its message type; each copy is owned by exactly one
//! consumer of that queue. Competing consumers subscribe the same queue,
//! fan-out subscribers bind distinct queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::context::CancellationSource;
use crate::envelope::{Address, Envelope, MessageKind};

pub mod channel;
pub mod dispatch;
pub mod lossy;

pub use channel::ChannelTransport;
pub use dispatch::{DispatchError, Dispatcher, DispatcherHandler, RedeliveryPolicy};
pub use lossy::{LossyConfig, LossyStats, LossyTransport};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: Address, capacity: usize },

    #[error("endpoint '{0}' is not registered")]
    UnknownEndpoint(Address),

    #[error("transport is shut down")]
    Closed,
}

/// Handler invoked for each delivery owned by a subscription.
pub trait DeliveryHandler: Send + Sync {
    /// Process one owned delivery.
    fn handle(
        &self,
        envelope: Envelope,
    ) -> BoxFuture<'static, std::result::Result<(), dispatch::DispatchError>>;
}

/// Binding of a message type to a named consumer queue.
///
/// Every subscriber using the same queue address joins one competing
/// consumer group for that queue.
#[derive(Debug, Clone)]
pub struct Binding {
    kind: MessageKind,
    queue: Address,
    concurrency: usize,
}

impl Binding {
    pub fn new(kind: MessageKind, queue: Address) -> Self {
        Self {
            kind,
            queue,
            concurrency: 1,
        }
    }

    /// The shared consumer-group queue for a message type. Every node using
    /// this binding competes for the same deliveries.
    pub fn group(kind: MessageKind) -> Self {
        let queue = Address::new(format!("queue.{}", kind.name()));
        Self::new(kind, queue)
    }

    /// A point-to-point endpoint queue owned by a single node.
    pub fn endpoint(kind: MessageKind, address: Address) -> Self {
        Self::new(kind, address)
    }

    /// Number of workers popping the queue for this subscription.
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn queue(&self) -> &Address {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Interface for message delivery between grid nodes.
///
/// Implementations:
/// - `ChannelTransport`: in-memory queues for a single process
/// - `LossyTransport`: loss-injecting wrapper for testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish to every queue bound to the envelope's message type.
    ///
    /// Each bound queue receives one copy; each copy is delivered to exactly
    /// one consumer of that queue. Publishing with no bound queues is not an
    /// error.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Deliver an envelope directly to a named endpoint queue.
    async fn send(&self, destination: &Address, envelope: Envelope) -> Result<()>;

    /// Register a competing consumer on the binding's queue.
    ///
    /// Returns the unsubscribe action for the consumer.
    async fn subscribe(
        &self,
        binding: Binding,
        handler: Box<dyn DeliveryHandler>,
    ) -> Result<Subscription>;

    /// Cancel all consumers and wait for in-flight deliveries to drain.
    async fn shutdown(&self) -> Result<()>;
}

/// Unsubscribe action returned by [`Transport::subscribe`].
pub struct Subscription {
    queue: Address,
    source: CancellationSource,
    gauge: Arc<WorkerGauge>,
}

impl Subscription {
    pub(crate) fn new(queue: Address, source: CancellationSource, gauge: Arc<WorkerGauge>) -> Self {
        Self {
            queue,
            source,
            gauge,
        }
    }

    pub fn queue(&self) -> &Address {
        &self.queue
    }

    /// Cooperatively stop the consumer and wait for its in-flight delivery
    /// to finish.
    pub async fn unsubscribe(self) {
        self.source.cancel();
        self.gauge.drained().await;
    }
}

/// Counts live consumer workers so shutdown can wait for cooperative drain.
pub(crate) struct WorkerGauge {
    active: AtomicUsize,
    changed: Notify,
}

impl WorkerGauge {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub(crate) fn enter(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Wait until every worker has exited.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
