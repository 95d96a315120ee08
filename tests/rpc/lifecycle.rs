//! Connecting, declaring and shutting down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use topic_rpc::bus::{InMemoryBroker, TransportError};
use topic_rpc::{BusOptions, Error, HandlerError, ServiceBus};

use crate::support::{self, PlaceOrder};

#[tokio::test]
async fn unreachable_broker_fails_at_connect() {
    let broker = InMemoryBroker::unreachable();
    let err = ServiceBus::connect(broker.connection(), BusOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Transport(TransportError::ConnectionRefused(_))
    ));
}

#[tokio::test]
async fn credentials_are_checked_at_connect() {
    let broker = InMemoryBroker::with_credentials("shop", "s3cret");

    let err = ServiceBus::connect(
        broker.connection(),
        BusOptions::default().with_credentials("shop", "wrong"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, Error::Transport(_)));

    ServiceBus::connect(
        broker.connection(),
        BusOptions::default().with_credentials("shop", "s3cret"),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn repeated_declaration_adds_no_bindings() {
    let (broker, server, _client) = support::pair().await;
    let bus = server.bus();

    for _ in 0..3 {
        bus.declare_and_bind_queue("audit", None, &["order.*", "invoice.#"])
            .await
            .unwrap();
    }

    assert_eq!(broker.bindings("audit").len(), 2);
    assert_eq!(
        broker.queue_names().iter().filter(|q| *q == "audit").count(),
        1
    );
}

#[tokio::test]
async fn shutdown_cancels_pending_calls() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("slow", "slow.echo", |n: u32| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, HandlerError>(n)
        })
        .await
        .unwrap();

    let client = Arc::new(client);
    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move {
        caller
            .call_with_timeout::<_, u32>("slow.echo", &1, Duration::from_secs(30))
            .await
    });

    assert!(support::eventually(|| client.pending_calls() == 1).await);
    client.shutdown().await.unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.stats().calls_cancelled, 1);
}

#[tokio::test]
async fn shutdown_drains_commands_in_flight() {
    let (broker, server, client) = support::pair().await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        server
            .register_command_handler("slow", "slow.echo", move |n: u32| {
                let started = Arc::clone(&started);
                let finished = Arc::clone(&finished);
                async move {
                    started.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok::<_, HandlerError>(n)
                }
            })
            .await
            .unwrap();
    }

    let client = Arc::new(client);
    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call::<_, u32>("slow.echo", &7).await });

    assert!(support::eventually(|| started.load(Ordering::SeqCst)).await);
    server.shutdown().await.unwrap();
    assert!(finished.load(Ordering::SeqCst), "shutdown returned before the handler");

    let stats = server.stats();
    assert_eq!(stats.commands_handled, 1);
    assert_eq!(stats.replies_published, 1);
    assert_eq!(stats.acks, 1);
    assert_eq!(broker.queue_depth("slow"), Some(0));
    assert_eq!(broker.unacked_count(), 0);

    assert_eq!(call.await.unwrap().unwrap(), 7);
}

#[tokio::test]
async fn shutdown_releases_broker_resources() {
    let (broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.echo", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order)
        })
        .await
        .unwrap();
    let _: PlaceOrder = client
        .call("order.echo", &PlaceOrder::sample(1))
        .await
        .unwrap();

    let reply_queue = broker
        .queue_names()
        .into_iter()
        .find(|q| q.starts_with("amq.gen-"))
        .unwrap();

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
    // Second shutdown is a no-op.
    server.shutdown().await.unwrap();

    assert!(!broker.queue_names().contains(&reply_queue));
    assert_eq!(broker.consumer_count("orders"), 0);
    assert!(server.bus().is_closed());

    let err = client
        .call::<_, PlaceOrder>("order.echo", &PlaceOrder::sample(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::ConnectionClosed)));
}

#[tokio::test]
async fn broker_failure_is_reported_by_shutdown() {
    let (broker, server, _client) = support::pair().await;
    server
        .register_command_handler("orders", "order.echo", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order)
        })
        .await
        .unwrap();

    broker.shutdown();
    // Let the consumer observe the failure before it is asked to stop.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = server.shutdown().await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::ConnectionClosed)));
}
