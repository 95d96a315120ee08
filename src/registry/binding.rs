//! Handler bindings - what runs when a delivery arrives on a queue.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::bus::Envelope;
use crate::listener::HandlerError;
use crate::topic::{RoutingKey, TopicPattern};

/// Boxed future returned by type-erased handlers.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send + 'static>>;

/// Type-erased event handler: decodes the envelope and runs the typed closure.
pub type EventHandlerFn = Arc<dyn Fn(&Envelope) -> HandlerFuture<()> + Send + Sync>;

/// Type-erased command handler: decodes the envelope, runs the typed closure
/// and returns the encoded reply payload.
pub type CommandHandlerFn = Arc<dyn Fn(&Envelope) -> HandlerFuture<Vec<u8>> + Send + Sync>;

/// Whether a binding handles events or commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Event,
    Command,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKind::Event => f.write_str("event"),
            BindingKind::Command => f.write_str("command"),
        }
    }
}

enum Matcher {
    Topic(TopicPattern),
    Exact(RoutingKey),
}

enum Handler {
    Event(EventHandlerFn),
    Command {
        handler: CommandHandlerFn,
        reply_exchange: Option<String>,
    },
}

/// One registered handler. Immutable once registered.
pub struct HandlerBinding {
    matcher: Matcher,
    handler: Handler,
    parameter_type: &'static str,
}

impl HandlerBinding {
    /// An event handler activated by every key matching `pattern`.
    pub fn event(pattern: TopicPattern, parameter_type: &'static str, handler: EventHandlerFn) -> Self {
        Self {
            matcher: Matcher::Topic(pattern),
            handler: Handler::Event(handler),
            parameter_type,
        }
    }

    /// A command handler for exactly `key`. Replies go through
    /// `reply_exchange`, or the bus exchange when `None`.
    pub fn command(
        key: RoutingKey,
        parameter_type: &'static str,
        reply_exchange: Option<String>,
        handler: CommandHandlerFn,
    ) -> Self {
        Self {
            matcher: Matcher::Exact(key),
            handler: Handler::Command {
                handler,
                reply_exchange,
            },
            parameter_type,
        }
    }

    pub fn kind(&self) -> BindingKind {
        match self.handler {
            Handler::Event(_) => BindingKind::Event,
            Handler::Command { .. } => BindingKind::Command,
        }
    }

    /// The pattern or key this binding was registered under.
    pub fn pattern(&self) -> &str {
        match &self.matcher {
            Matcher::Topic(pattern) => pattern.as_str(),
            Matcher::Exact(key) => key.as_str(),
        }
    }

    /// Type name of the payload the handler decodes.
    pub fn parameter_type(&self) -> &'static str {
        self.parameter_type
    }

    pub fn reply_exchange(&self) -> Option<&str> {
        match &self.handler {
            Handler::Command { reply_exchange, .. } => reply_exchange.as_deref(),
            Handler::Event(_) => None,
        }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        match &self.matcher {
            Matcher::Topic(pattern) => pattern.matches(routing_key),
            Matcher::Exact(key) => key.as_str() == routing_key,
        }
    }

    /// Run the event handler against `envelope`.
    pub(crate) fn handle_event(&self, envelope: &Envelope) -> HandlerFuture<()> {
        match &self.handler {
            Handler::Event(handler) => handler(envelope),
            Handler::Command { .. } => self.wrong_kind(),
        }
    }

    /// Run the command handler against `envelope`, yielding the encoded reply.
    pub(crate) fn handle_command(&self, envelope: &Envelope) -> HandlerFuture<Vec<u8>> {
        match &self.handler {
            Handler::Command { handler, .. } => handler(envelope),
            Handler::Event(_) => self.wrong_kind(),
        }
    }

    fn wrong_kind<T: Send + 'static>(&self) -> HandlerFuture<T> {
        let message = format!("'{}' is bound as {}", self.pattern(), self.kind());
        Box::pin(async move { Err(HandlerError::other(message)) })
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("kind", &self.kind())
            .field("pattern", &self.pattern())
            .field("parameter_type", &self.parameter_type)
            .field("reply_exchange", &self.reply_exchange())
            .finish()
    }
}
