//! Event listener - topic-pattern handlers on shared queues.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::error::HandlerError;
use super::handler::{event_handler, run_isolated};
use super::stop_consumers;
use crate::bus::{Bus, ConsumeOptions, ConsumerHandle, Envelope, MessageType};
use crate::error::{ConfigurationError, Result};
use crate::registry::{CallbackRegistry, HandlerBinding};
use crate::topic::TopicPattern;

/// Dispatches event deliveries to every handler whose pattern matches.
///
/// Several patterns may share one queue. The broker only guarantees a
/// delivery reaches the queue; which handlers run is decided here, in
/// registration order. A delivery matching no pattern is acknowledged and
/// dropped, counted in `events_unmatched`. So are command requests and
/// replies that a broad pattern such as `#` routes to the queue.
pub struct EventListener {
    bus: Arc<Bus>,
    registry: Arc<CallbackRegistry>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl EventListener {
    pub fn new(bus: Arc<Bus>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            bus,
            registry,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `handler` for every event on `queue` whose key matches `pattern`.
    ///
    /// The pattern is compiled and the queue checked before anything touches
    /// the broker.
    pub async fn register<T, F, Fut>(&self, queue: &str, pattern: &str, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        if pattern.is_empty() {
            return Err(ConfigurationError::EmptyKey.into());
        }
        let compiled = TopicPattern::parse(pattern).map_err(ConfigurationError::InvalidPattern)?;
        let binding = HandlerBinding::event(compiled, type_name::<T>(), event_handler(handler));
        let id = self.registry.add_binding(queue, binding)?;

        if let Err(error) = self.start(queue, pattern).await {
            self.registry.remove_binding(queue, id);
            return Err(error);
        }
        tracing::info!(queue, pattern, "event handler registered");
        Ok(())
    }

    async fn start(&self, queue: &str, pattern: &str) -> Result<()> {
        self.bus.declare_and_bind_queue(queue, None, &[pattern]).await?;

        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Ok(());
        }

        let bus = Arc::clone(&self.bus);
        let registry = Arc::clone(&self.registry);
        let name = queue.to_string();
        let handle = self
            .bus
            .consume(queue, ConsumeOptions::manual_ack(0), move |envelope| {
                dispatch(
                    Arc::clone(&bus),
                    Arc::clone(&registry),
                    name.clone(),
                    envelope,
                )
            })
            .await?;
        consumers.insert(queue.to_string(), handle);
        Ok(())
    }

    /// Queues with a running consumer.
    pub async fn queues(&self) -> Vec<String> {
        self.consumers.lock().await.keys().cloned().collect()
    }

    /// Stop every consumer. Returns the first transport failure any of them
    /// ended with.
    pub async fn shutdown(&self) -> Result<()> {
        stop_consumers(&self.consumers).await
    }
}

async fn dispatch(bus: Arc<Bus>, registry: Arc<CallbackRegistry>, queue: String, envelope: Envelope) {
    let stats = bus.stats();
    let bindings = if envelope.message_type == MessageType::Event {
        registry.matching(&queue, &envelope.routing_key)
    } else {
        Vec::new()
    };

    if bindings.is_empty() {
        stats.event_unmatched();
        tracing::warn!(
            queue = %queue,
            routing_key = %envelope.routing_key,
            message_id = %envelope.message_id,
            message_type = ?envelope.message_type,
            "no event handler matches delivery, dropping it"
        );
    }

    for binding in bindings {
        match run_isolated(binding.handle_event(&envelope)).await {
            Ok(()) => stats.event_dispatched(),
            Err(error) => {
                stats.event_failed();
                tracing::warn!(
                    queue = %queue,
                    routing_key = %envelope.routing_key,
                    pattern = binding.pattern(),
                    error = %error,
                    "event handler failed"
                );
            }
        }
    }

    if let Some(tag) = envelope.delivery_tag {
        if let Err(error) = bus.acknowledge(tag).await {
            tracing::error!(queue = %queue, tag = %tag, error = %error, "failed to acknowledge event");
        }
    }
}
