//! Failing calls: remote errors, timeouts, late replies and bad registrations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use topic_rpc::{ConfigurationError, Error, HandlerError};

use crate::support::{self, PlaceOrder};

#[tokio::test]
async fn handler_error_becomes_remote_error_and_is_acked_once() {
    let (broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.place", |order: PlaceOrder| async move {
            Err::<(), _>(HandlerError::rejected(format!(
                "order {} is out of stock",
                order.order_id
            )))
        })
        .await
        .unwrap();

    let err = client
        .call::<_, ()>("order.place", &PlaceOrder::sample(9))
        .await
        .unwrap_err();

    match err {
        Error::RemoteHandler { message, kind, .. } => {
            assert_eq!(message, "rejected: order 9 is out of stock");
            assert_eq!(kind.as_deref(), Some("rejected"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    assert!(support::eventually(|| server.stats().acks == 1).await);
    let acks = broker.ack_counts();
    assert_eq!(acks.len(), 1);
    assert!(acks.values().all(|count| *count == 1));
    assert_eq!(broker.unacked_count(), 0);

    let stats = server.stats();
    assert_eq!(stats.commands_failed, 1);
    assert_eq!(stats.replies_published, 1);
}

#[tokio::test]
async fn nested_cause_travels_with_the_error() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.place", |_: PlaceOrder| async move {
            let io = std::io::Error::new(std::io::ErrorKind::Other, "warehouse offline");
            Err::<(), _>(HandlerError::other(io))
        })
        .await
        .unwrap();

    let err = client
        .call::<_, ()>("order.place", &PlaceOrder::sample(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RemoteHandler { cause: Some(ref cause), .. } if cause == "warehouse offline"
    ));
}

#[tokio::test]
async fn undecodable_request_is_a_remote_error() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.place", |order: PlaceOrder| async move {
            Ok::<_, HandlerError>(order.order_id)
        })
        .await
        .unwrap();

    let err = client
        .call::<_, u32>("order.place", "not an order")
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(err.to_string().contains("decode failed"), "{err}");
    assert_eq!(err.remote_kind(), Some("decode_failed"));
    assert_eq!(server.stats().commands_failed, 1);
}

#[tokio::test]
async fn panicking_handler_still_replies_and_acks() {
    let (broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.place", |order: PlaceOrder| async move {
            if order.order_id == 0 {
                panic!("order id zero");
            }
            Ok::<_, HandlerError>(order.order_id)
        })
        .await
        .unwrap();

    let err = client
        .call::<_, u32>("order.place", &PlaceOrder::sample(0))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "remote handler failed: handler panicked: order id zero");
    assert_eq!(err.remote_kind(), Some("panicked"));

    // The listener survives and keeps serving.
    let id: u32 = client
        .call("order.place", &PlaceOrder::sample(5))
        .await
        .unwrap();
    assert_eq!(id, 5);

    assert!(support::eventually(|| broker.unacked_count() == 0 && server.stats().acks == 2).await);
    assert!(broker.ack_counts().values().all(|count| *count == 1));
}

#[tokio::test]
async fn unhandled_key_on_command_queue_replies_with_error() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("orders", "order.place", |_: PlaceOrder| async move {
            Ok::<_, HandlerError>(())
        })
        .await
        .unwrap();
    // Route a second key to the queue without a handler for it.
    server
        .bus()
        .declare_and_bind_queue("orders", None, &["order.cancel"])
        .await
        .unwrap();

    let err = client.call::<_, ()>("order.cancel", &1).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "remote handler failed: no handler registered for command 'order.cancel'"
    );
    assert_eq!(err.remote_kind(), Some("unknown_command"));
}

#[tokio::test]
async fn unanswered_call_times_out_and_forgets_the_call() {
    let (_broker, _server, client) = support::pair().await;
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let err = client
        .call_with_timeout::<_, ()>("nobody.listens", &1, timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        Error::Timeout {
            destination,
            timeout: waited,
            ..
        } => {
            assert_eq!(destination, "nobody.listens");
            assert_eq!(*waited, timeout);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("nobody.listens"));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.stats().calls_timed_out, 1);
}

#[tokio::test]
async fn late_reply_is_dropped() {
    let (_broker, server, client) = support::pair().await;
    server
        .register_command_handler("slow", "slow.echo", |n: u32| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, HandlerError>(n)
        })
        .await
        .unwrap();

    let err = client
        .call_with_timeout::<_, u32>("slow.echo", &1, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.pending_calls(), 0);

    assert!(support::eventually(|| client.stats().replies_dropped == 1).await);
    assert_eq!(client.stats().replies_resolved, 0);
    assert_eq!(client.pending_calls(), 0);

    // The bus keeps working after the stale reply.
    let n: u32 = client.call("slow.echo", &2).await.unwrap();
    assert_eq!(n, 2);
}

#[tokio::test]
async fn dropped_call_future_leaves_no_pending_entry() {
    let (_broker, _server, client) = support::pair().await;
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let task = tokio::spawn(async move {
        caller
            .call_with_timeout::<_, ()>("nobody.listens", &1, Duration::from_secs(30))
            .await
    });

    assert!(support::eventually(|| client.pending_calls() == 1).await);
    task.abort();
    let _ = task.await;

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn wildcard_command_keys_fail_at_registration() {
    let (broker, server, _client) = support::pair().await;

    for key in ["order.*", "order.#", "*.place"] {
        let err = server
            .register_command_handler("orders", key, |_: PlaceOrder| async move {
                Ok::<_, HandlerError>(())
            })
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Configuration(ConfigurationError::WildcardInCommandKey(ref k)) if k == key
            ),
            "{key}: {err}"
        );
    }

    assert!(!broker.queue_names().contains(&"orders".to_string()));
    assert_eq!(server.stats(), Default::default());
}

#[tokio::test]
async fn empty_names_fail_at_registration() {
    let (_broker, server, _client) = support::pair().await;

    let err = server
        .register_command_handler("", "order.place", |_: PlaceOrder| async move {
            Ok::<_, HandlerError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::EmptyQueueName)
    ));

    let err = server
        .register_command_handler("orders", "", |_: PlaceOrder| async move {
            Ok::<_, HandlerError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(ConfigurationError::EmptyKey)));
}
