use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::timeout;
use uuid::Uuid;

use super::*;
use crate::envelope::MessageKind;
use crate::grid::DeliveryTally;

#[derive(Debug)]
struct Ping(u64);

#[derive(Debug)]
struct Other;

/// Records every owned delivery into a shared tally.
struct TallyHandler {
    tally: Arc<DeliveryTally>,
}

impl TallyHandler {
    fn boxed(tally: &Arc<DeliveryTally>) -> Box<dyn DeliveryHandler> {
        Box::new(Self {
            tally: Arc::clone(tally),
        })
    }
}

impl DeliveryHandler for TallyHandler {
    fn handle(
        &self,
        envelope: Envelope,
    ) -> BoxFuture<'static, std::result::Result<(), DispatchError>> {
        let tally = Arc::clone(&self.tally);
        Box::pin(async move {
            tally.record(envelope.correlation_id(), envelope.source_address());
            Ok(())
        })
    }
}

fn envelope(value: u64) -> Envelope {
    Envelope::new(Ping(value), Uuid::new_v4(), Address::new("publisher"))
}

#[tokio::test]
async fn test_publish_reaches_single_subscriber_once() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    transport
        .subscribe(
            Binding::group(MessageKind::of::<Ping>()),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();

    let sent = envelope(1);
    let correlation_id = sent.correlation_id();
    transport.publish(sent).await.unwrap();

    timeout(Duration::from_secs(1), tally.wait_for_total(1))
        .await
        .expect("delivery should arrive");
    assert_eq!(tally.correlation_counts().get(&correlation_id), Some(&1));
}

#[tokio::test]
async fn test_publish_with_no_bindings_is_ok() {
    let transport = ChannelTransport::default();
    assert!(transport.publish(envelope(1)).await.is_ok());
}

#[tokio::test]
async fn test_competing_consumers_own_each_delivery_exactly_once() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    // Two subscriptions on the same group queue compete for deliveries.
    for _ in 0..2 {
        transport
            .subscribe(
                Binding::group(MessageKind::of::<Ping>()),
                TallyHandler::boxed(&tally),
            )
            .await
            .unwrap();
    }

    for i in 0..20 {
        transport.publish(envelope(i)).await.unwrap();
    }

    timeout(Duration::from_secs(2), tally.wait_for_total(20))
        .await
        .expect("all deliveries should arrive");

    let counts = tally.correlation_counts();
    assert_eq!(counts.len(), 20);
    assert!(counts.values().all(|&count| count == 1));
}

#[tokio::test]
async fn test_distinct_queues_fan_out_copies() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    transport
        .subscribe(
            Binding::endpoint(MessageKind::of::<Ping>(), Address::new("node-a")),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();
    transport
        .subscribe(
            Binding::endpoint(MessageKind::of::<Ping>(), Address::new("node-b")),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();

    let sent = envelope(1);
    let correlation_id = sent.correlation_id();
    transport.publish(sent).await.unwrap();

    timeout(Duration::from_secs(1), tally.wait_for_total(2))
        .await
        .expect("both copies should arrive");
    assert_eq!(tally.correlation_counts().get(&correlation_id), Some(&2));
}

#[tokio::test]
async fn test_send_targets_named_endpoint() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    transport
        .subscribe(
            Binding::endpoint(MessageKind::of::<Ping>(), Address::new("node-a")),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();

    transport
        .send(&Address::new("node-a"), envelope(9))
        .await
        .unwrap();

    timeout(Duration::from_secs(1), tally.wait_for_total(1))
        .await
        .expect("sent envelope should arrive");
}

#[tokio::test]
async fn test_send_to_unknown_endpoint_fails() {
    let transport = ChannelTransport::default();

    let result = transport.send(&Address::new("nowhere"), envelope(1)).await;

    assert!(matches!(result, Err(BusError::UnknownEndpoint(_))));
}

#[tokio::test]
async fn test_full_queue_rejects_publish() {
    let transport = ChannelTransport::new(TransportConfig { queue_capacity: 1 });
    let tally = Arc::new(DeliveryTally::new());

    // Subscribe, then stop the consumer so the queue backs up.
    let subscription = transport
        .subscribe(
            Binding::group(MessageKind::of::<Ping>()),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();
    subscription.unsubscribe().await;

    transport.publish(envelope(1)).await.unwrap();
    let result = transport.publish(envelope(2)).await;

    assert!(matches!(result, Err(BusError::QueueFull { .. })));
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    let subscription = transport
        .subscribe(
            Binding::group(MessageKind::of::<Ping>()),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();

    transport.publish(envelope(1)).await.unwrap();
    timeout(Duration::from_secs(1), tally.wait_for_total(1))
        .await
        .expect("first delivery should arrive");

    subscription.unsubscribe().await;

    // Later publishes stay queued; no consumer owns them.
    transport.publish(envelope(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tally.total(), 1);
    assert_eq!(transport.depth(Binding::group(MessageKind::of::<Ping>()).queue()), 1);
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let transport = ChannelTransport::default();
    let tally = Arc::new(DeliveryTally::new());

    transport
        .subscribe(
            Binding::group(MessageKind::of::<Ping>()),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();

    transport.shutdown().await.unwrap();

    assert!(matches!(
        transport.publish(envelope(1)).await,
        Err(BusError::Closed)
    ));
    assert!(matches!(
        transport
            .subscribe(
                Binding::group(MessageKind::of::<Other>()),
                TallyHandler::boxed(&tally),
            )
            .await,
        Err(BusError::Closed)
    ));
}

#[tokio::test]
async fn test_depth_reports_queued_envelopes() {
    let transport = ChannelTransport::default();
    let queue = Address::new("node-a");

    assert_eq!(transport.depth(&queue), 0);

    // Create the endpoint queue via a subscription that never consumes.
    let tally = Arc::new(DeliveryTally::new());
    let subscription = transport
        .subscribe(
            Binding::endpoint(MessageKind::of::<Ping>(), queue.clone()),
            TallyHandler::boxed(&tally),
        )
        .await
        .unwrap();
    subscription.unsubscribe().await;

    transport.send(&queue, envelope(1)).await.unwrap();
    transport.send(&queue, envelope(2)).await.unwrap();

    assert_eq!(transport.depth(&queue), 2);
}
