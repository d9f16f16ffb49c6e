//! In-memory channel transport.
//!
//! Queues are mutex-guarded deques with a `Notify` for wakeups; consumer
//! workers pop cooperatively, so exactly one worker owns each envelope.
//! No broker, no wall-clock convergence; this is what the grid
//! verification suite runs against.

use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::TransportConfig;
use crate::context::{CancellationSource, CancellationToken};
use crate::envelope::{Address, Envelope};

use super::{
    Binding, BusError, DeliveryHandler, DispatchError, Result, Subscription, Transport, WorkerGauge,
};

/// One named queue: FIFO of envelopes plus a wakeup for blocked consumers.
struct MessageQueue {
    address: Address,
    capacity: usize,
    items: Mutex<VecDeque<Envelope>>,
    available: tokio::sync::Notify,
}

impl MessageQueue {
    fn new(address: Address, capacity: usize) -> Self {
        Self {
            address,
            capacity,
            items: Mutex::new(VecDeque::new()),
            available: tokio::sync::Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, envelope: Envelope) -> Result<()> {
        {
            let mut items = self.items();
            if items.len() >= self.capacity {
                return Err(BusError::QueueFull {
                    queue: self.address.clone(),
                    capacity: self.capacity,
                });
            }
            items.push_back(envelope);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the next envelope, waiting until one arrives or the consumer is
    /// cancelled. Each envelope is handed to exactly one caller.
    async fn pop(&self, cancel: &CancellationToken) -> Option<Envelope> {
        loop {
            // Register for wakeup before checking the queue so a push between
            // the check and the await is not lost.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.items().pop_front() {
                return Some(envelope);
            }
            if cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn depth(&self) -> usize {
        self.items().len()
    }
}

struct SubscriptionEntry {
    queue: Address,
    gauge: Arc<WorkerGauge>,
}

struct ChannelState {
    config: TransportConfig,
    /// Queue name -> queue. Queues are created on first subscribe.
    queues: Mutex<HashMap<Address, Arc<MessageQueue>>>,
    /// Message type -> queues bound to it (fan-out set).
    bindings: Mutex<HashMap<TypeId, Vec<Address>>>,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    lifetime: CancellationSource,
}

impl ChannelState {
    fn queues(&self) -> MutexGuard<'_, HashMap<Address, Arc<MessageQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Address>>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<SubscriptionEntry>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create the queue with the given name.
    fn queue(&self, address: &Address) -> Arc<MessageQueue> {
        let mut queues = self.queues();
        Arc::clone(queues.entry(address.clone()).or_insert_with(|| {
            Arc::new(MessageQueue::new(
                address.clone(),
                self.config.queue_capacity,
            ))
        }))
    }
}

/// In-memory transport using per-queue deques and cooperative consumers.
#[derive(Clone)]
pub struct ChannelTransport {
    state: Arc<ChannelState>,
}

impl ChannelTransport {
    pub fn new(config: TransportConfig) -> Self {
        info!(
            queue_capacity = config.queue_capacity,
            "Channel transport initialized"
        );
        Self {
            state: Arc::new(ChannelState {
                config,
                queues: Mutex::new(HashMap::new()),
                bindings: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                lifetime: CancellationSource::new(),
            }),
        }
    }

    /// Current depth of a queue; zero when the queue does not exist.
    pub fn depth(&self, queue: &Address) -> usize {
        self.state
            .queues()
            .get(queue)
            .map(|queue| queue.depth())
            .unwrap_or(0)
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if self.state.lifetime.is_cancelled() {
            return Err(BusError::Closed);
        }

        let targets: Vec<Address> = self
            .state
            .bindings()
            .get(&envelope.kind().type_id())
            .cloned()
            .unwrap_or_default();

        if targets.is_empty() {
            // No receivers, that's okay for publish-only scenarios.
            debug!(
                message_type = envelope.kind().name(),
                correlation_id = %envelope.correlation_id(),
                "Published with no bound queues"
            );
            return Ok(());
        }

        let queue_count = targets.len();
        for address in targets {
            self.state.queue(&address).push(envelope.clone())?;
        }

        debug!(
            message_type = envelope.kind().name(),
            correlation_id = %envelope.correlation_id(),
            queues = queue_count,
            "Published envelope"
        );
        Ok(())
    }

    async fn send(&self, destination: &Address, envelope: Envelope) -> Result<()> {
        if self.state.lifetime.is_cancelled() {
            return Err(BusError::Closed);
        }

        let queue = self
            .state
            .queues()
            .get(destination)
            .cloned()
            .ok_or_else(|| BusError::UnknownEndpoint(destination.clone()))?;

        debug!(
            destination = %destination,
            correlation_id = %envelope.correlation_id(),
            "Sending envelope to endpoint"
        );
        queue.push(envelope)
    }

    async fn subscribe(
        &self,
        binding: Binding,
        handler: Box<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        if self.state.lifetime.is_cancelled() {
            return Err(BusError::Closed);
        }

        let queue = self.state.queue(binding.queue());

        {
            let mut bindings = self.state.bindings();
            let bound = bindings.entry(binding.kind().type_id()).or_default();
            if !bound.contains(binding.queue()) {
                bound.push(binding.queue().clone());
            }
        }

        let source = self.state.lifetime.child();
        let gauge = Arc::new(WorkerGauge::new());
        let handler: Arc<dyn DeliveryHandler> = Arc::from(handler);

        for _ in 0..binding.concurrency() {
            let queue = Arc::clone(&queue);
            let token = source.token();
            let gauge = Arc::clone(&gauge);
            let handler = Arc::clone(&handler);
            // Count the worker before it is scheduled so a drain started
            // immediately after subscribe still waits for it.
            gauge.enter();
            tokio::spawn(async move {
                while let Some(envelope) = queue.pop(&token).await {
                    let correlation_id = envelope.correlation_id();
                    match handler.handle(envelope).await {
                        Ok(()) => {}
                        Err(DispatchError::Cancelled) => {
                            debug!(correlation_id = %correlation_id, "Delivery run cancelled");
                        }
                        Err(e) => {
                            error!(correlation_id = %correlation_id, error = %e, "Delivery handler failed");
                        }
                    }
                }
                gauge.exit();
            });
        }

        info!(
            queue = %binding.queue(),
            message_type = binding.kind().name(),
            workers = binding.concurrency(),
            "Consumer subscribed"
        );

        self.state.subscriptions().push(SubscriptionEntry {
            queue: binding.queue().clone(),
            gauge: Arc::clone(&gauge),
        });

        Ok(Subscription::new(binding.queue().clone(), source, gauge))
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.lifetime.cancel();

        let entries: Vec<SubscriptionEntry> = self.state.subscriptions().drain(..).collect();
        for entry in entries {
            entry.gauge.drained().await;
            debug!(queue = %entry.queue, "Consumer drained");
        }

        info!("Channel transport drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
