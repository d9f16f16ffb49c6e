//! Lossy transport wrapper for testing unreliable message delivery.
//!
//! Wraps any `Transport` implementation and optionally drops publishes
//! based on a configurable probability. Sends and subscriptions pass
//! through untouched; loss is injected between publisher and queue.
//!
//! # Example
//!
//! ```ignore
//! use weft::bus::{ChannelTransport, LossyConfig, LossyTransport};
//!
//! // Create a transport that drops 10% of publishes
//! let inner = ChannelTransport::default();
//! let lossy = LossyTransport::new(inner, LossyConfig::with_drop_rate(0.1));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::envelope::{Address, Envelope};

use super::{Binding, DeliveryHandler, Result, Subscription, Transport};

/// Configuration for lossy behavior.
#[derive(Clone, Debug)]
pub struct LossyConfig {
    /// Probability of dropping a publish (0.0 to 1.0).
    pub drop_rate: f64,
    /// Whether to log dropped envelopes.
    pub log_drops: bool,
}

impl Default for LossyConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl LossyConfig {
    /// Never drop (pass-through).
    pub fn none() -> Self {
        Self {
            drop_rate: 0.0,
            log_drops: false,
        }
    }

    /// Drop with the given probability, clamped to [0.0, 1.0].
    pub fn with_drop_rate(rate: f64) -> Self {
        Self {
            drop_rate: rate.clamp(0.0, 1.0),
            log_drops: true,
        }
    }

    /// Drop every publish.
    pub fn drop_all() -> Self {
        Self {
            drop_rate: 1.0,
            log_drops: true,
        }
    }

    pub fn is_lossy(&self) -> bool {
        self.drop_rate > 0.0
    }
}

/// Statistics for the lossy transport.
#[derive(Debug, Default)]
pub struct LossyStats {
    /// Total envelopes offered for publish.
    pub total: AtomicU64,
    /// Envelopes that were dropped.
    pub dropped: AtomicU64,
    /// Envelopes that were passed through.
    pub passed: AtomicU64,
}

impl LossyStats {
    /// Snapshot of (total, dropped, passed).
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.passed.load(Ordering::Relaxed),
        )
    }
}

/// Wrapper that optionally drops publishes for testing.
pub struct LossyTransport<T> {
    inner: T,
    config: LossyConfig,
    stats: Arc<LossyStats>,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, config: LossyConfig) -> Self {
        if config.is_lossy() {
            warn!(
                drop_rate = config.drop_rate,
                "Lossy transport enabled - publishes may be dropped"
            );
        }

        Self {
            inner,
            config,
            stats: Arc::new(LossyStats::default()),
        }
    }

    /// Pass-through wrapper (no loss).
    pub fn passthrough(inner: T) -> Self {
        Self::new(inner, LossyConfig::none())
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn stats(&self) -> Arc<LossyStats> {
        Arc::clone(&self.stats)
    }

    fn should_drop(&self) -> bool {
        if self.config.drop_rate <= 0.0 {
            return false;
        }
        if self.config.drop_rate >= 1.0 {
            return true;
        }
        rand::rng().random::<f64>() < self.config.drop_rate
    }
}

#[async_trait]
impl<T: Transport> Transport for LossyTransport<T> {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if self.should_drop() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            if self.config.log_drops {
                debug!(
                    correlation_id = %envelope.correlation_id(),
                    message_type = envelope.kind().name(),
                    "Lossy transport dropped publish"
                );
            }
            // Report success but never enqueue.
            return Ok(());
        }

        self.stats.passed.fetch_add(1, Ordering::Relaxed);
        self.inner.publish(envelope).await
    }

    async fn send(&self, destination: &Address, envelope: Envelope) -> Result<()> {
        self.inner.send(destination, envelope).await
    }

    async fn subscribe(
        &self,
        binding: Binding,
        handler: Box<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        self.inner.subscribe(binding, handler).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}
