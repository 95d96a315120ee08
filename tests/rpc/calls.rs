//! Successful calls: round trips, concurrency, formats and reply exchanges.

use std::sync::Arc;

use topic_rpc::bus::{InMemoryBroker, PayloadFormat};
use topic_rpc::HandlerError;

use crate::support::{self, OrderPlaced, PlaceOrder};

#[tokio::test]
async fn echo_round_trip() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.echo", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order)
        })
        .await
        .unwrap();

    let sent = PlaceOrder::sample(7);
    let received: PlaceOrder = client.call("order.echo", &sent).await.unwrap();

    assert_eq!(received, sent);
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.stats().replies_resolved, 1);
    assert_eq!(server.stats().commands_handled, 1);
}

#[tokio::test]
async fn caller_and_handler_on_one_bus() {
    let broker = InMemoryBroker::new();
    let bus = support::connect(&broker).await;
    bus.register_command_handler("math", "math.square", |n: i64| async move {
        Ok::<_, HandlerError>(n * n)
    })
    .await
    .unwrap();

    let squared: i64 = bus.call("math.square", &12).await.unwrap();
    assert_eq!(squared, 144);
}

#[tokio::test]
async fn concurrent_calls_never_cross_talk() {
    let (_broker, server, client) = support::pair().await;

    for shard in 0..5 {
        let name = format!("shard-{shard}");
        let queue = format!("orders-{shard}");
        let key = format!("order.place.s{shard}");
        server
            .register_command_handler(&queue, &key, move |order: PlaceOrder| {
                let handled_by = name.clone();
                async move {
                    Ok::<_, HandlerError>(OrderPlaced {
                        order_id: order.order_id,
                        handled_by,
                    })
                }
            })
            .await
            .unwrap();
    }

    let client = Arc::new(client);
    let calls: Vec<_> = (0..60u32)
        .map(|order_id| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let key = format!("order.place.s{}", order_id % 5);
                let reply: OrderPlaced = client
                    .call(&key, &PlaceOrder::sample(order_id))
                    .await
                    .unwrap();
                (order_id, reply)
            })
        })
        .collect();

    for call in calls {
        let (order_id, reply) = call.await.unwrap();
        assert_eq!(reply.order_id, order_id);
        assert_eq!(reply.handled_by, format!("shard-{}", order_id % 5));
    }
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.stats().replies_resolved, 60);
    assert_eq!(client.stats().replies_dropped, 0);
}

#[tokio::test]
async fn callers_sharing_a_key_only_see_their_own_replies() {
    let broker = InMemoryBroker::new();
    let server = support::connect(&broker).await;
    let first = Arc::new(support::connect(&broker).await);
    let second = Arc::new(support::connect(&broker).await);

    server
        .register_command_handler("orders", "order.echo", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order)
        })
        .await
        .unwrap();

    // One call each binds both reply queues to order.echo.Reply, so every
    // later reply reaches both callers.
    let _: PlaceOrder = first.call("order.echo", &PlaceOrder::sample(0)).await.unwrap();
    let _: PlaceOrder = second.call("order.echo", &PlaceOrder::sample(1000)).await.unwrap();

    let mut calls = Vec::new();
    for (caller, base) in [(&first, 0u32), (&second, 1000u32)] {
        for n in 1..=30 {
            let caller = Arc::clone(caller);
            let sent = PlaceOrder::sample(base + n);
            calls.push(tokio::spawn(async move {
                let received: PlaceOrder = caller.call("order.echo", &sent).await.unwrap();
                (sent, received)
            }));
        }
    }
    for call in calls {
        let (sent, received) = call.await.unwrap();
        assert_eq!(received, sent);
    }

    // Each caller dropped the other's 30 replies.
    assert!(support::eventually(|| first.stats().replies_dropped >= 30).await);
    assert!(support::eventually(|| second.stats().replies_dropped >= 30).await);
    assert_eq!(first.stats().replies_resolved, 31);
    assert_eq!(second.stats().replies_resolved, 31);
    assert_eq!(first.pending_calls() + second.pending_calls(), 0);
}

#[tokio::test]
async fn several_keys_share_one_command_queue() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("math", "math.add", |(a, b): (i64, i64)| async move {
            Ok::<_, HandlerError>(a + b)
        })
        .await
        .unwrap();
    server
        .register_command_handler("math", "math.mul", |(a, b): (i64, i64)| async move {
            Ok::<_, HandlerError>(a * b)
        })
        .await
        .unwrap();

    let sum: i64 = client.call("math.add", &(6, 7)).await.unwrap();
    let product: i64 = client.call("math.mul", &(6, 7)).await.unwrap();
    assert_eq!((sum, product), (13, 42));
}

#[tokio::test]
async fn bitcode_payloads() {
    let broker = InMemoryBroker::new();
    let options = support::options().with_payload_format(PayloadFormat::Bitcode);
    let server = support::connect_with(&broker, options.clone()).await;
    let client = support::connect_with(&broker, options).await;

    server
        .register_command_handler("orders", "order.echo", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order)
        })
        .await
        .unwrap();

    let sent = PlaceOrder::sample(3);
    let received: PlaceOrder = client.call("order.echo", &sent).await.unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn json_caller_bitcode_handler() {
    let broker = InMemoryBroker::new();
    let server = support::connect_with(
        &broker,
        support::options().with_payload_format(PayloadFormat::Bitcode),
    )
    .await;
    let client = support::connect(&broker).await;

    server
        .register_command_handler("math", "math.negate", |n: i64| async move {
            Ok::<_, HandlerError>(-n)
        })
        .await
        .unwrap();

    // The handler decodes by the request's content type and the caller by
    // the reply's.
    let negated: i64 = client.call("math.negate", &5).await.unwrap();
    assert_eq!(negated, -5);
}

#[tokio::test]
async fn replies_through_explicit_exchange() {
    let (broker, server, client) = support::pair().await;
    server
        .register_command_handler_on("orders", "order.echo", "order_replies", |n: u32| async move {
            Ok::<_, HandlerError>(n + 1)
        })
        .await
        .unwrap();

    let reply: u32 = client.call("order.echo", &41).await.unwrap();
    assert_eq!(reply, 42);

    let reply_queue = broker
        .queue_names()
        .into_iter()
        .find(|name| name.starts_with("amq.gen-"))
        .unwrap();
    assert!(broker
        .bindings(&reply_queue)
        .contains(&("order_replies".to_string(), "order.echo.Reply".to_string())));
}
