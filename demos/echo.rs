//! Echo service and caller on one in-memory broker.
//!
//! ```text
//! RUST_LOG=topic_rpc=debug cargo run --example echo
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use topic_rpc::bus::InMemoryBroker;
use topic_rpc::{BusOptions, HandlerError, ServiceBus};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Serialize, Deserialize)]
struct Shout {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Echoed {
    text: String,
    length: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Shouted {
    text: String,
}

#[tokio::main]
async fn main() -> topic_rpc::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "topic_rpc=debug,echo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = BusOptions::from_env()?;
    let broker = InMemoryBroker::new();

    let service = ServiceBus::connect(broker.connection(), options.clone()).await?;
    service
        .register_command_handler("echo", "echo.shout", |shout: Shout| async move {
            if shout.text.is_empty() {
                return Err(HandlerError::rejected("nothing to shout"));
            }
            Ok::<_, HandlerError>(Echoed {
                length: shout.text.len(),
                text: shout.text.to_uppercase(),
            })
        })
        .await?;
    service
        .register_event_handler("echo-audit", "echo.#", |event: Shouted| async move {
            tracing::info!(text = %event.text, "audit saw a shout");
            Ok::<_, HandlerError>(())
        })
        .await?;

    let caller = ServiceBus::connect(broker.connection(), options).await?;

    let reply: Echoed = caller
        .call("echo.shout", &Shout { text: "hello".into() })
        .await?;
    tracing::info!(text = %reply.text, length = reply.length, "echo replied");
    caller
        .publish_event("echo.shouted", &Shouted { text: reply.text })
        .await?;

    match caller
        .call::<_, Echoed>("echo.shout", &Shout { text: String::new() })
        .await
    {
        Err(err) if err.is_remote() => tracing::warn!(error = %err, "echo refused"),
        other => tracing::error!(?other, "expected a remote error"),
    }

    let whisper = Shout {
        text: "psst".into(),
    };
    match caller
        .call_with_timeout::<_, Echoed>("echo.whisper", &whisper, Duration::from_millis(200))
        .await
    {
        Err(err) if err.is_timeout() => tracing::warn!(error = %err, "nobody answers whispers"),
        other => tracing::error!(?other, "expected a timeout"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(service = ?service.stats(), caller = ?caller.stats(), "done");

    caller.shutdown().await?;
    service.shutdown().await?;
    Ok(())
}
