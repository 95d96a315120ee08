//! ServiceBus - the per-process entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::{Bus, Envelope, StatsSnapshot, Transport};
use crate::config::BusOptions;
use crate::error::Result;
use crate::listener::{CommandListener, EventListener, HandlerError};
use crate::registry::CallbackRegistry;
use crate::rpc::RpcClient;
use crate::topic::RoutingKey;

/// Events, commands and calls over one broker connection.
///
/// ## Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use topic_rpc::bus::InMemoryBroker;
/// use topic_rpc::{BusOptions, HandlerError, ServiceBus};
///
/// #[derive(Serialize, Deserialize)]
/// struct Add {
///     a: i64,
///     b: i64,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> topic_rpc::Result<()> {
/// let broker = InMemoryBroker::new();
///
/// let server = ServiceBus::connect(broker.connection(), BusOptions::default()).await?;
/// server
///     .register_command_handler("math", "math.add", |cmd: Add| async move {
///         Ok::<_, HandlerError>(cmd.a + cmd.b)
///     })
///     .await?;
///
/// let client = ServiceBus::connect(broker.connection(), BusOptions::default()).await?;
/// let sum: i64 = client.call("math.add", &Add { a: 2, b: 3 }).await?;
/// assert_eq!(sum, 5);
///
/// client.shutdown().await?;
/// server.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBus {
    bus: Arc<Bus>,
    registry: Arc<CallbackRegistry>,
    rpc: RpcClient,
    events: EventListener,
    commands: CommandListener,
}

impl ServiceBus {
    /// Open `transport` and declare the bus exchange.
    ///
    /// Fails with [`Error::Transport`](crate::Error::Transport) if the broker
    /// cannot be reached.
    pub async fn connect<T: Transport>(transport: T, options: BusOptions) -> Result<Self> {
        let bus = Arc::new(Bus::connect(Arc::new(transport), options).await?);
        Ok(Self::from_bus(bus))
    }

    /// Build on an already connected [`Bus`].
    pub fn from_bus(bus: Arc<Bus>) -> Self {
        let registry = Arc::new(CallbackRegistry::new());
        Self {
            rpc: RpcClient::new(Arc::clone(&bus), Arc::clone(&registry)),
            events: EventListener::new(Arc::clone(&bus), Arc::clone(&registry)),
            commands: CommandListener::new(Arc::clone(&bus), Arc::clone(&registry)),
            bus,
            registry,
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Publish an event. Fire-and-forget: the broker fans it out to every
    /// queue bound with a matching pattern, or discards it if there is none.
    pub async fn publish_event<T>(&self, routing_key: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = RoutingKey::parse(routing_key)?;
        let format = self.bus.payload_format();
        let envelope = Envelope::event(&key, format.encode(payload)?, format.content_type());
        let message_id = envelope.message_id.clone();

        self.bus.publish(envelope, None).await?;
        self.bus.stats().event_published();
        tracing::debug!(routing_key, message_id = %message_id, "event published");
        Ok(())
    }

    /// Run `handler` for events on `queue` whose key matches `pattern`.
    pub async fn register_event_handler<T, F, Fut>(
        &self,
        queue: &str,
        pattern: &str,
        handler: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.events.register(queue, pattern, handler).await
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Answer commands sent to `key` with `handler`, replying through the bus
    /// exchange.
    pub async fn register_command_handler<Req, Resp, F, Fut>(
        &self,
        queue: &str,
        key: &str,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        self.commands.register(queue, key, None, handler).await
    }

    /// Like [`register_command_handler`](Self::register_command_handler), but
    /// replies go through `reply_exchange`.
    pub async fn register_command_handler_on<Req, Resp, F, Fut>(
        &self,
        queue: &str,
        key: &str,
        reply_exchange: &str,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        self.commands
            .register(queue, key, Some(reply_exchange), handler)
            .await
    }

    /// Call the command handler for `destination` with the configured
    /// timeout.
    pub async fn call<Req, Resp>(&self, destination: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.rpc
            .call(destination, request, self.bus.options().rpc_timeout())
            .await
    }

    pub async fn call_with_timeout<Req, Resp>(
        &self,
        destination: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.rpc.call(destination, request, timeout).await
    }

    // ========================================================================
    // Introspection and lifecycle
    // ========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.bus.stats().snapshot()
    }

    /// Calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.registry.pending_count()
    }

    /// Stop listeners, cancel pending calls and close the connection.
    ///
    /// Commands already being handled finish, reply and ack before the
    /// connection closes, so none of them is redelivered.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        let events = self.events.shutdown().await;
        let commands = self.commands.shutdown().await;
        let replies = self.rpc.shutdown().await;
        self.registry.cancel_all();
        let closed = self.bus.close().await;

        events.and(commands).and(replies).and(closed)
    }
}

impl Drop for ServiceBus {
    fn drop(&mut self) {
        self.bus.cancel();
        self.registry.cancel_all();
    }
}
