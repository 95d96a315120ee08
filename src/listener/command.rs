//! Command listener - runs one handler per command key and answers every
//! delivery with exactly one reply and exactly one acknowledgment.
//!
//! Per delivery:
//!
//! ```text
//! received -> reply binding ensured -> handler invoked
//!          -> success | handler error | decode error
//!          -> reply published -> acknowledged
//! ```
//!
//! The handler runs in its own task, so neither an error nor a panic can
//! skip the last two steps. Shutdown waits for deliveries already being
//! handled, so their replies and acks go out before the connection closes.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use super::error::HandlerError;
use super::handler::{command_handler, run_isolated};
use super::reply::{reply_key, ErrorReply};
use super::stop_consumers;
use crate::bus::{Bus, ConsumeOptions, ConsumerHandle, Envelope};
use crate::error::{ConfigurationError, Result};
use crate::registry::{CallbackRegistry, HandlerBinding};
use crate::topic::{contains_wildcard, RoutingKey};

/// Binds command keys to handlers and runs the reply protocol.
pub struct CommandListener {
    bus: Arc<Bus>,
    registry: Arc<CallbackRegistry>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    in_flight: TaskTracker,
}

impl CommandListener {
    pub fn new(bus: Arc<Bus>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            bus,
            registry,
            consumers: Mutex::new(HashMap::new()),
            in_flight: TaskTracker::new(),
        }
    }

    /// Answer commands sent to `key` on `queue` with `handler`.
    ///
    /// Replies go through `reply_exchange`, or the bus exchange when `None`.
    /// A key containing `*` or `#` is rejected here; commands are
    /// point-to-point.
    pub async fn register<Req, Resp, F, Fut>(
        &self,
        queue: &str,
        key: &str,
        reply_exchange: Option<&str>,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        if queue.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName.into());
        }
        if key.is_empty() {
            return Err(ConfigurationError::EmptyKey.into());
        }
        if contains_wildcard(key) {
            return Err(ConfigurationError::WildcardInCommandKey(key.to_string()).into());
        }
        let routing_key = RoutingKey::parse(key).map_err(ConfigurationError::InvalidPattern)?;
        if reply_exchange.is_some_and(str::is_empty) {
            return Err(ConfigurationError::InvalidSetting {
                name: "reply_exchange",
                value: String::new(),
            }
            .into());
        }

        let binding = HandlerBinding::command(
            routing_key,
            type_name::<Req>(),
            reply_exchange.map(str::to_string),
            command_handler(self.bus.payload_format(), handler),
        );
        let id = self.registry.add_binding(queue, binding)?;

        if let Err(error) = self.start(queue, key, reply_exchange).await {
            self.registry.remove_binding(queue, id);
            return Err(error);
        }
        tracing::info!(queue, key, reply_exchange, "command handler registered");
        Ok(())
    }

    async fn start(&self, queue: &str, key: &str, reply_exchange: Option<&str>) -> Result<()> {
        if let Some(exchange) = reply_exchange {
            self.bus.declare_exchange(exchange).await?;
        }
        self.bus.declare_and_bind_queue(queue, None, &[key]).await?;

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Ok(());
        }

        let bus = Arc::clone(&self.bus);
        let registry = Arc::clone(&self.registry);
        let name = queue.to_string();
        let prefetch = self.bus.options().command_prefetch;
        let in_flight = self.in_flight.clone();
        let handle = self
            .bus
            .consume(queue, ConsumeOptions::manual_ack(prefetch), move |envelope| {
                // Off the delivery loop; prefetch bounds how many run at once.
                in_flight.spawn(handle_delivery(
                    Arc::clone(&bus),
                    Arc::clone(&registry),
                    name.clone(),
                    envelope,
                ));
                std::future::ready(())
            })
            .await?;
        consumers.insert(queue.to_string(), handle);
        Ok(())
    }

    pub async fn queues(&self) -> Vec<String> {
        self.consumers.lock().await.keys().cloned().collect()
    }

    /// Deliveries currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop every consumer, then wait for deliveries already being handled
    /// to reply and ack. Returns the first transport failure any consumer
    /// ended with.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = stop_consumers(&self.consumers).await;

        self.in_flight.close();
        if !self.in_flight.is_empty() {
            tracing::debug!(in_flight = self.in_flight.len(), "waiting for command handlers");
        }
        self.in_flight.wait().await;
        stopped
    }
}

async fn handle_delivery(
    bus: Arc<Bus>,
    registry: Arc<CallbackRegistry>,
    queue: String,
    request: Envelope,
) {
    let stats = bus.stats();

    let Some((reply_to, correlation_id)) = request.reply_route() else {
        stats.command_malformed();
        tracing::warn!(
            queue = %queue,
            routing_key = %request.routing_key,
            message_id = %request.message_id,
            "command without reply route, dropping it"
        );
        acknowledge(&bus, &queue, &request).await;
        return;
    };

    let binding = registry.command_binding(&queue, &request.routing_key);
    let exchange = binding
        .as_ref()
        .and_then(|b| b.reply_exchange())
        .unwrap_or(bus.exchange())
        .to_string();

    let reply_key = reply_key(&request.routing_key);
    if let Err(error) = bus.bind_transient(reply_to, &exchange, &reply_key).await {
        tracing::warn!(
            reply_to,
            exchange = %exchange,
            reply_key = %reply_key,
            error = %error,
            "could not bind reply queue"
        );
    }

    tracing::debug!(queue = %queue, routing_key = %request.routing_key, correlation_id, "handling command");
    let outcome = match &binding {
        Some(binding) => run_isolated(binding.handle_command(&request)).await,
        None => Err(HandlerError::UnknownCommand(request.routing_key.clone())),
    };

    let format = bus.payload_format();
    let (payload, is_error) = match outcome {
        Ok(payload) => {
            stats.command_handled();
            (payload, false)
        }
        Err(error) => {
            stats.command_failed();
            tracing::warn!(
                queue = %queue,
                routing_key = %request.routing_key,
                correlation_id,
                error = %error,
                "command handler failed, replying with error"
            );
            (ErrorReply::from(&error).encode(format), true)
        }
    };

    let reply = Envelope::reply(&request, reply_key, payload, format.content_type(), is_error);
    match bus.publish(reply, Some(&exchange)).await {
        Ok(()) => stats.reply_published(),
        Err(error) => tracing::error!(
            queue = %queue,
            correlation_id,
            error = %error,
            "failed to publish reply"
        ),
    }

    acknowledge(&bus, &queue, &request).await;
}

async fn acknowledge(bus: &Bus, queue: &str, request: &Envelope) {
    if let Some(tag) = request.delivery_tag {
        if let Err(error) = bus.acknowledge(tag).await {
            tracing::error!(queue, tag = %tag, error = %error, "failed to acknowledge command");
        }
    }
}
