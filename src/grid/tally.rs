//! Delivery tally: the observable side effect the grid contract is audited by.
//!
//! An explicitly passed, mutex-guarded accumulator of per-correlation-id and
//! per-source-address counts. Created before a run, shared with the handlers
//! under test, read after drain, discarded after assertion. Never ambient
//! global state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::envelope::Address;

#[derive(Default)]
struct TallyState {
    correlations: HashMap<Uuid, usize>,
    sources: HashMap<Address, usize>,
    total: usize,
}

/// Counts observed deliveries by correlation id and source address.
#[derive(Default)]
pub struct DeliveryTally {
    state: Mutex<TallyState>,
    changed: Notify,
}

impl DeliveryTally {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TallyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one observation. Each mutation holds the exclusive section.
    pub fn record(&self, correlation_id: Uuid, source: &Address) {
        {
            let mut state = self.state();
            *state.correlations.entry(correlation_id).or_insert(0) += 1;
            *state.sources.entry(source.clone()).or_insert(0) += 1;
            state.total += 1;
        }
        self.changed.notify_waiters();
    }

    /// Total observations recorded so far.
    pub fn total(&self) -> usize {
        self.state().total
    }

    /// Snapshot of observations grouped by correlation id.
    pub fn correlation_counts(&self) -> HashMap<Uuid, usize> {
        self.state().correlations.clone()
    }

    /// Snapshot of observations grouped by source address.
    pub fn source_counts(&self) -> HashMap<Address, usize> {
        self.state().sources.clone()
    }

    /// Suspend until at least `expected` observations have been recorded.
    ///
    /// The deterministic drain primitive: callers await a count instead of
    /// sleeping for wall-clock convergence.
    pub async fn wait_for_total(&self, expected: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.total() >= expected {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_record_counts_by_correlation_and_source() {
        let tally = DeliveryTally::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        tally.record(first, &Address::new("node-a"));
        tally.record(first, &Address::new("node-b"));
        tally.record(second, &Address::new("node-a"));

        assert_eq!(tally.total(), 3);
        let correlations = tally.correlation_counts();
        assert_eq!(correlations.get(&first), Some(&2));
        assert_eq!(correlations.get(&second), Some(&1));
        let sources = tally.source_counts();
        assert_eq!(sources.get(&Address::new("node-a")), Some(&2));
        assert_eq!(sources.get(&Address::new("node-b")), Some(&1));
    }

    #[test]
    fn test_wait_is_pending_until_count_reached() {
        let tally = Arc::new(DeliveryTally::new());

        let mut waiting = task::spawn({
            let tally = Arc::clone(&tally);
            async move { tally.wait_for_total(2).await }
        });

        assert_pending!(waiting.poll());

        tally.record(Uuid::new_v4(), &Address::new("node-a"));
        assert_pending!(waiting.poll());

        tally.record(Uuid::new_v4(), &Address::new("node-a"));
        assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_reached() {
        let tally = DeliveryTally::new();
        tally.record(Uuid::new_v4(), &Address::new("node-a"));

        timeout(Duration::from_millis(100), tally.wait_for_total(1))
            .await
            .expect("count already reached");
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let tally = Arc::new(DeliveryTally::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tally = Arc::clone(&tally);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tally.record(Uuid::new_v4(), &Address::new("node-a"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tally.total(), 400);
        assert_eq!(tally.source_counts().get(&Address::new("node-a")), Some(&400));
    }
}
