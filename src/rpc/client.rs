use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};

use crate::bus::{decode_payload, Bus, BusStats, ConsumeOptions, ConsumerHandle, Envelope};
use crate::error::{ConfigurationError, Error, Result};
use crate::listener::ErrorReply;
use crate::registry::{CallbackRegistry, CorrelationId, PendingGuard, PendingOutcome};
use crate::topic::RoutingKey;

/// Turns publish-then-receive into one awaitable call.
///
/// Each client owns a private, server-named reply queue, declared and
/// consumed the first time it is needed. Replies are matched to waiting
/// calls by correlation id through the shared [`CallbackRegistry`]; a reply
/// nobody is waiting for is dropped and counted in `replies_dropped`.
pub struct RpcClient {
    bus: Arc<Bus>,
    registry: Arc<CallbackRegistry>,
    reply_queue: OnceCell<String>,
    reply_consumer: Mutex<Option<ConsumerHandle>>,
}

impl RpcClient {
    pub fn new(bus: Arc<Bus>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            bus,
            registry,
            reply_queue: OnceCell::new(),
            reply_consumer: Mutex::new(None),
        }
    }

    /// The private reply queue, once it exists.
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply_queue.get().map(String::as_str)
    }

    /// Send `request` to the command handler for `destination` and wait up to
    /// `timeout` for its reply.
    ///
    /// The pending slot is registered before the request is published and is
    /// removed however the call ends, including when this future is dropped.
    pub async fn call<Req, Resp>(
        &self,
        destination: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if timeout.is_zero() {
            return Err(ConfigurationError::InvalidTimeout.into());
        }
        let key = RoutingKey::parse(destination)?;
        let format = self.bus.payload_format();
        let payload = format.encode(request)?;
        let reply_to = self.ensure_reply_queue().await?;

        let correlation_id = CorrelationId::new();
        let receiver = self.registry.register_pending(correlation_id, destination)?;
        let _guard = PendingGuard::new(&self.registry, correlation_id);

        let envelope = Envelope::command(
            &key,
            payload,
            format.content_type(),
            correlation_id,
            reply_to.as_str(),
        );
        self.bus.publish(envelope, None).await?;
        tracing::debug!(
            correlation_id = %correlation_id,
            destination,
            timeout_ms = timeout.as_millis() as u64,
            "command sent"
        );

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped without an answer: the registry is being torn down.
            Ok(Err(_)) => PendingOutcome::Cancelled,
            Err(_) => {
                self.registry.remove_pending(&correlation_id);
                self.bus.stats().call_timed_out();
                tracing::warn!(
                    correlation_id = %correlation_id,
                    destination,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out"
                );
                return Err(Error::Timeout {
                    correlation_id,
                    destination: destination.to_string(),
                    timeout,
                });
            }
        };

        match outcome {
            PendingOutcome::Reply(reply) => read_reply(&reply),
            PendingOutcome::Cancelled => {
                self.bus.stats().call_cancelled();
                Err(Error::Cancelled { correlation_id })
            }
        }
    }

    async fn ensure_reply_queue(&self) -> Result<&String> {
        self.reply_queue
            .get_or_try_init(|| async {
                let queue = self.bus.declare_private_queue().await?;
                let registry = Arc::clone(&self.registry);
                let stats = Arc::clone(self.bus.stats());
                let handle = self
                    .bus
                    .consume(&queue, ConsumeOptions::auto_ack(), move |reply| {
                        resolve_reply(&registry, &stats, reply);
                        std::future::ready(())
                    })
                    .await?;
                *self.reply_consumer.lock().await = Some(handle);
                tracing::debug!(queue = %queue, "reply queue ready");
                Ok::<_, Error>(queue)
            })
            .await
    }

    /// Stop consuming replies.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.reply_consumer.lock().await.take() else {
            return Ok(());
        };
        handle.stop().await?;
        Ok(())
    }
}

fn resolve_reply(registry: &CallbackRegistry, stats: &BusStats, reply: Envelope) {
    let correlation_id = reply
        .correlation_id
        .as_deref()
        .and_then(|raw| raw.parse::<CorrelationId>().ok());

    let Some(correlation_id) = correlation_id else {
        stats.reply_dropped();
        tracing::debug!(
            routing_key = %reply.routing_key,
            correlation_id = ?reply.correlation_id,
            "reply without usable correlation id, dropping it"
        );
        return;
    };

    if registry.resolve(&correlation_id, reply) {
        stats.reply_resolved();
    } else {
        stats.reply_dropped();
        tracing::debug!(correlation_id = %correlation_id, "no pending call for reply, dropping it");
    }
}

fn read_reply<Resp: DeserializeOwned>(reply: &Envelope) -> Result<Resp> {
    if reply.is_error {
        return Err(ErrorReply::from_envelope(reply).into_error());
    }
    Ok(decode_payload(reply)?)
}
