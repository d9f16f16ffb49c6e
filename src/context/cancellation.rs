//! Cooperative cancellation for pipeline runs.
//!
//! The owner of a run holds a `CancellationSource`; stages only ever see the
//! read-only `CancellationToken` and bail out at safe points when it is
//! signaled. There is no forced unwinding. Sources form a chain: cancelling
//! a parent (bus shutdown) cancels every child run, while cancelling a child
//! leaves its siblings untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;

#[derive(Default)]
struct Flag {
    cancelled: AtomicBool,
    changed: Notify,
}

impl Flag {
    fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    async fn wait(&self) {
        // Register as a waiter before checking the flag so a signal between
        // the check and the await is not lost.
        let notified = self.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Owner-side handle that signals cancellation.
///
/// Cloning shares the same signal; use [`child`](Self::child) for a signal
/// that is also cancelled whenever this one is.
#[derive(Clone)]
pub struct CancellationSource {
    // Own flag first, ancestors after.
    chain: Vec<Arc<Flag>>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(Flag::default())],
        }
    }

    /// Derive a source cancelled by its own `cancel` or by any ancestor.
    pub fn child(&self) -> Self {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Arc::new(Flag::default()));
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Read-only handle for observers.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            chain: self.chain.clone(),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.chain[0].set();
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| flag.is_set())
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a cancellation signal.
///
/// Stages observe the token; they never create or complete it.
#[derive(Clone)]
pub struct CancellationToken {
    chain: Vec<Arc<Flag>>,
}

impl CancellationToken {
    /// A token that is never cancelled (no source holds its flag).
    pub fn none() -> Self {
        Self {
            chain: vec![Arc::new(Flag::default())],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| flag.is_set())
    }

    /// Suspend until the signal fires anywhere in the chain.
    pub async fn cancelled(&self) {
        let waits: Vec<BoxFuture<'_, ()>> = self
            .chain
            .iter()
            .map(|flag| Box::pin(flag.wait()) as BoxFuture<'_, ()>)
            .collect();
        futures::future::select_all(waits).await;
    }
}
