//! Local dispatch: envelope in, pipeline run, correlated responses out.
//!
//! The dispatcher is the entry point the transport hands each owned
//! delivery to. It builds a fresh `MessageContext` per run with its own
//! child cancellation token, executes the node pipe, and on completion
//! drains the context's response buffer to the command's response address,
//! preserving the inbound correlation id end-to-end.
//!
//! Redelivery wraps pipe execution from the outside: only `Faulted` runs
//! are retried, each attempt gets a fresh context, and cancellation is
//! terminal. The dispatcher itself never re-publishes or duplicates a
//! delivery.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::RedeliveryConfig;
use crate::context::{CancellationSource, MessageContext, ResponseBuffer};
use crate::envelope::{Address, Envelope};
use crate::pipe::{Pipe, PipeError, RunOutcome};

use super::{BusError, DeliveryHandler, Transport};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The pipe run faulted; eligible for redelivery.
    #[error("pipeline faulted: {0}")]
    Faulted(#[source] PipeError),

    /// The pipe run observed cancellation; terminal, never redelivered.
    #[error("pipeline run was cancelled")]
    Cancelled,

    /// The run completed but a response could not be delivered.
    #[error("response delivery failed: {0}")]
    Response(#[source] BusError),
}

impl DispatchError {
    fn is_redeliverable(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}

/// Backoff applied between redeliveries of a faulted run.
///
/// - Min delay: 10ms
/// - Max delay: 2s
/// - Max attempts: 3
/// - Jitter enabled
///
/// (Defaults; all four come from [`RedeliveryConfig`].)
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    max_attempts: usize,
    min_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RedeliveryPolicy {
    pub fn new(config: &RedeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// No redelivery: the first fault surfaces as-is.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::new(&RedeliveryConfig::default())
    }
}

/// Runs a node's pipe over each owned delivery.
pub struct Dispatcher {
    pipe: Pipe<MessageContext>,
    transport: Arc<dyn Transport>,
    address: Address,
    lifetime: CancellationSource,
    redelivery: RedeliveryPolicy,
}

impl Dispatcher {
    pub fn new(
        pipe: Pipe<MessageContext>,
        transport: Arc<dyn Transport>,
        address: Address,
        lifetime: CancellationSource,
        redelivery: RedeliveryPolicy,
    ) -> Self {
        Self {
            pipe,
            transport,
            address,
            lifetime,
            redelivery,
        }
    }

    /// Dispatch one delivery, redelivering faulted runs per policy.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let correlation_id = envelope.correlation_id();

        (|| {
            let envelope = envelope.clone();
            async move { self.dispatch_once(envelope).await }
        })
        .retry(self.redelivery.backoff())
        .when(DispatchError::is_redeliverable)
        .notify(|error: &DispatchError, delay: Duration| {
            warn!(
                correlation_id = %correlation_id,
                error = %error,
                delay = ?delay,
                "Pipeline faulted, scheduling redelivery"
            );
        })
        .await
    }

    /// One pipe run over a fresh context.
    async fn dispatch_once(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let run = self.lifetime.child();
        let correlation_id = envelope.correlation_id();
        let mut ctx = MessageContext::for_envelope(envelope, run.token());

        match self.pipe.execute(&mut ctx).await {
            RunOutcome::Completed => {
                debug!(correlation_id = %correlation_id, "Pipeline run completed");
                self.deliver_responses(&ctx).await
            }
            RunOutcome::Faulted(error) => Err(DispatchError::Faulted(error)),
            RunOutcome::Cancelled => Err(DispatchError::Cancelled),
        }
    }

    /// Forward buffered responses to the command's response address with the
    /// inbound correlation id.
    async fn deliver_responses(&self, ctx: &MessageContext) -> Result<(), DispatchError> {
        let Some(buffer) = ctx.try_get_payload::<ResponseBuffer>() else {
            return Ok(());
        };
        let pending = buffer.drain();
        if pending.is_empty() {
            return Ok(());
        }

        let Some(response_address) = ctx.response_address() else {
            warn!(
                correlation_id = %ctx.correlation_id(),
                responses = pending.len(),
                "Responses produced but the command named no response address"
            );
            return Ok(());
        };

        for response in pending {
            let envelope = Envelope::from_parts(
                response.kind,
                response.message,
                ctx.correlation_id(),
                self.address.clone(),
                None,
            );
            self.transport
                .send(response_address, envelope)
                .await
                .map_err(DispatchError::Response)?;
        }
        Ok(())
    }
}

/// Adapter exposing a dispatcher as a transport delivery handler.
pub struct DispatcherHandler(Arc<Dispatcher>);

impl DispatcherHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self(dispatcher)
    }
}

impl DeliveryHandler for DispatcherHandler {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<(), DispatchError>> {
        let dispatcher = Arc::clone(&self.0);
        Box::pin(async move { dispatcher.dispatch(envelope).await })
    }
}
