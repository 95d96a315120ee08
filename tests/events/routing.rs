//! Topic fan-out and in-queue dispatch.

use topic_rpc::bus::InMemoryBroker;
use topic_rpc::{ConfigurationError, Error, HandlerError};

use crate::support::{self, Journal, OrderEvent};

async fn record_under(bus: &topic_rpc::ServiceBus, queue: &str, pattern: &str, journal: &Journal) {
    let journal = journal.clone();
    let label = pattern.to_string();
    bus.register_event_handler(queue, pattern, move |event: OrderEvent| {
        let journal = journal.clone();
        let entry = format!("{}@{}", label, event.order_id);
        async move {
            journal.record(entry);
            Ok::<_, HandlerError>(())
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn overlapping_patterns_run_in_registration_order() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&bus, "audit", "order.*", &journal).await;
    record_under(&bus, "audit", "#.placed", &journal).await;
    record_under(&bus, "audit", "invoice.#", &journal).await;

    bus.publish_event("order.placed", &OrderEvent { order_id: 1 })
        .await
        .unwrap();

    assert!(support::eventually(|| journal.len() == 2).await);
    assert_eq!(journal.entries(), vec!["order.*@1", "#.placed@1"]);
    assert!(support::eventually(|| bus.stats().acks == 1).await);
    assert_eq!(bus.stats().events_dispatched, 2);
}

#[tokio::test]
async fn in_queue_dispatch_agrees_with_broker_routing() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    let journal = Journal::default();

    for pattern in ["a.*", "a.#", "#", "*.b", "a.b.c", "#.c"] {
        record_under(&bus, "table", pattern, &journal).await;
    }

    let cases: [(&str, &[&str]); 5] = [
        ("a", &["a.#", "#"]),
        ("a.b", &["a.*", "a.#", "#", "*.b"]),
        ("a.b.c", &["a.#", "#", "a.b.c", "#.c"]),
        ("x.b", &["#", "*.b"]),
        ("c", &["#", "#.c"]),
    ];

    let mut expected = Vec::new();
    for (order_id, (key, patterns)) in cases.iter().enumerate() {
        let order_id = order_id as u32;
        for pattern in *patterns {
            assert!(topic_rpc::topic::matches(pattern, key).unwrap());
            expected.push(format!("{}@{}", pattern, order_id));
        }
        bus.publish_event(key, &OrderEvent { order_id }).await.unwrap();
    }

    assert!(support::eventually(|| journal.len() == expected.len()).await);
    assert_eq!(journal.entries(), expected);
    assert_eq!(bus.stats().events_unmatched, 0);
}

#[tokio::test]
async fn events_fan_out_to_every_bound_queue() {
    let broker = InMemoryBroker::new();
    let billing = support::connect(&broker).await;
    let shipping = support::connect(&broker).await;
    let publisher = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&billing, "billing", "order.placed", &journal).await;
    record_under(&shipping, "shipping", "order.#", &journal).await;

    publisher
        .publish_event("order.placed", &OrderEvent { order_id: 4 })
        .await
        .unwrap();

    assert!(support::eventually(|| journal.len() == 2).await);
    let mut entries = journal.entries();
    entries.sort();
    assert_eq!(entries, vec!["order.#@4", "order.placed@4"]);
    assert_eq!(publisher.stats().events_published, 1);
}

#[tokio::test]
async fn competing_services_share_a_queue() {
    let broker = InMemoryBroker::new();
    let first = support::connect(&broker).await;
    let second = support::connect(&broker).await;
    let publisher = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&first, "workers", "job.*", &journal).await;
    record_under(&second, "workers", "job.*", &journal).await;

    for order_id in 0..10 {
        publisher
            .publish_event("job.run", &OrderEvent { order_id })
            .await
            .unwrap();
    }

    // Each event is handled once, by one of the two.
    assert!(support::eventually(|| journal.len() == 10).await);
    assert!(first.stats().events_dispatched > 0);
    assert!(second.stats().events_dispatched > 0);
    assert_eq!(
        first.stats().events_dispatched + second.stats().events_dispatched,
        10
    );
}

#[tokio::test]
async fn unmatched_delivery_is_acked_and_counted() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&bus, "audit", "order.*", &journal).await;
    // Something else routes invoices to the same queue.
    bus.bus()
        .declare_and_bind_queue("audit", None, &["invoice.*"])
        .await
        .unwrap();

    bus.publish_event("invoice.paid", &OrderEvent { order_id: 1 })
        .await
        .unwrap();

    assert!(support::eventually(|| bus.stats().events_unmatched == 1).await);
    assert!(support::eventually(|| bus.stats().acks == 1).await);
    assert_eq!(journal.len(), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn commands_and_replies_are_not_events() {
    let broker = InMemoryBroker::new();
    let audit = support::connect(&broker).await;
    let orders = support::connect(&broker).await;
    let caller = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&audit, "audit", "#", &journal).await;
    orders
        .register_command_handler("orders", "order.place", |event: OrderEvent| async move {
            Ok::<_, HandlerError>(event)
        })
        .await
        .unwrap();

    let placed: OrderEvent = caller
        .call("order.place", &OrderEvent { order_id: 3 })
        .await
        .unwrap();
    assert_eq!(placed.order_id, 3);

    // The request and its reply both reach the audit queue.
    assert!(support::eventually(|| audit.stats().events_unmatched == 2).await);
    assert!(support::eventually(|| audit.stats().acks == 2).await);
    assert_eq!(journal.len(), 0);
    assert_eq!(audit.stats().events_dispatched, 0);
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_others() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    let journal = Journal::default();

    bus.register_event_handler("audit", "order.*", |_: OrderEvent| async move {
        Err::<(), _>(HandlerError::rejected("audit store unavailable"))
    })
    .await
    .unwrap();
    bus.register_event_handler("audit", "order.*", |event: OrderEvent| async move {
        assert_ne!(event.order_id, 8, "handler bug");
        Ok::<_, HandlerError>(())
    })
    .await
    .unwrap();
    record_under(&bus, "audit", "order.*", &journal).await;

    bus.publish_event("order.placed", &OrderEvent { order_id: 8 })
        .await
        .unwrap();

    assert!(support::eventually(|| journal.len() == 1).await);
    assert!(support::eventually(|| bus.stats().acks == 1).await);
    let stats = bus.stats();
    assert_eq!(stats.events_failed, 2);
    assert_eq!(stats.events_dispatched, 1);
    assert_eq!(broker.ack_counts().values().copied().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test]
async fn events_and_commands_never_share_a_queue() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    let journal = Journal::default();

    record_under(&bus, "orders", "order.*", &journal).await;
    let err = bus
        .register_command_handler("orders", "order.place", |event: OrderEvent| async move {
            Ok::<_, HandlerError>(event.order_id)
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::MixedQueue { ref queue }) if queue == "orders"
    ));
}

#[tokio::test]
async fn invalid_keys_and_patterns_are_rejected() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;

    let err = bus
        .publish_event("order.*", &OrderEvent { order_id: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRoutingKey(_)));

    let err = bus
        .register_event_handler("audit", "order.#x", |_: OrderEvent| async move {
            Ok::<_, HandlerError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::InvalidPattern(_))
    ));
    assert_eq!(bus.stats().events_published, 0);
}
