//! Callback registry - handler bindings per queue and pending calls per
//! correlation id.
//!
//! Both maps are sharded (`DashMap`), so registering on one queue never waits
//! on a delivery being dispatched on another, and resolving one call never
//! waits on another call. Binding lists are cloned out before dispatch; no
//! shard lock is held across an `.await`.

mod binding;
mod correlation;
mod pending;

pub use binding::{BindingKind, CommandHandlerFn, EventHandlerFn, HandlerBinding, HandlerFuture};
pub use correlation::CorrelationId;
pub use pending::{PendingGuard, PendingOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::bus::Envelope;
use crate::error::{ConfigurationError, Error};
use pending::PendingCall;

/// Identifies one registered binding, for rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

/// Shared by the listeners (bindings) and the RPC client (pending calls) of
/// one bus.
#[derive(Default)]
pub struct CallbackRegistry {
    bindings: DashMap<String, Vec<(BindingId, Arc<HandlerBinding>)>>,
    pending: DashMap<CorrelationId, PendingCall>,
    next_binding: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    /// Append `binding` to `queue`'s dispatch list.
    ///
    /// A queue carries either event bindings or command bindings, and each
    /// command key has at most one handler per queue.
    pub fn add_binding(
        &self,
        queue: &str,
        binding: HandlerBinding,
    ) -> Result<BindingId, ConfigurationError> {
        if queue.trim().is_empty() {
            return Err(ConfigurationError::EmptyQueueName);
        }

        let mut entry = self.bindings.entry(queue.to_string()).or_default();
        if entry.iter().any(|(_, b)| b.kind() != binding.kind()) {
            return Err(ConfigurationError::MixedQueue {
                queue: queue.to_string(),
            });
        }
        if binding.kind() == BindingKind::Command
            && entry.iter().any(|(_, b)| b.pattern() == binding.pattern())
        {
            return Err(ConfigurationError::DuplicateCommand {
                queue: queue.to_string(),
                key: binding.pattern().to_string(),
            });
        }

        let id = BindingId(self.next_binding.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            queue,
            kind = %binding.kind(),
            pattern = binding.pattern(),
            parameter_type = binding.parameter_type(),
            "handler registered"
        );
        entry.push((id, Arc::new(binding)));
        Ok(id)
    }

    /// Remove a binding added by [`add_binding`](Self::add_binding).
    pub fn remove_binding(&self, queue: &str, id: BindingId) -> bool {
        let Some(mut entry) = self.bindings.get_mut(queue) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(existing, _)| *existing != id);
        let removed = entry.len() != before;
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty {
            self.bindings.remove_if(queue, |_, list| list.is_empty());
        }
        removed
    }

    /// Every binding on `queue`, in registration order.
    pub fn bindings(&self, queue: &str) -> Vec<Arc<HandlerBinding>> {
        self.bindings
            .get(queue)
            .map(|list| list.iter().map(|(_, b)| Arc::clone(b)).collect())
            .unwrap_or_default()
    }

    /// Bindings on `queue` activated by `routing_key`, in registration order.
    pub fn matching(&self, queue: &str, routing_key: &str) -> Vec<Arc<HandlerBinding>> {
        self.bindings
            .get(queue)
            .map(|list| {
                list.iter()
                    .filter(|(_, b)| b.matches(routing_key))
                    .map(|(_, b)| Arc::clone(b))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The command handler for `routing_key` on `queue`.
    pub fn command_binding(&self, queue: &str, routing_key: &str) -> Option<Arc<HandlerBinding>> {
        self.bindings.get(queue).and_then(|list| {
            list.iter()
                .find(|(_, b)| b.kind() == BindingKind::Command && b.matches(routing_key))
                .map(|(_, b)| Arc::clone(b))
        })
    }

    /// What `queue` carries, if anything is registered on it.
    pub fn queue_kind(&self, queue: &str) -> Option<BindingKind> {
        self.bindings
            .get(queue)
            .and_then(|list| list.first().map(|(_, b)| b.kind()))
    }

    /// Queues with at least one binding.
    pub fn queues(&self) -> Vec<String> {
        self.bindings.iter().map(|e| e.key().clone()).collect()
    }

    // ========================================================================
    // Pending calls
    // ========================================================================

    /// Open a result slot for `correlation_id`. Must happen before the request
    /// is published.
    pub fn register_pending(
        &self,
        correlation_id: CorrelationId,
        destination: &str,
    ) -> Result<oneshot::Receiver<PendingOutcome>, Error> {
        match self.pending.entry(correlation_id) {
            Entry::Occupied(_) => Err(Error::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall::new(destination.to_string(), tx));
                Ok(rx)
            }
        }
    }

    /// Complete the pending call for `correlation_id` with `reply`.
    ///
    /// Returns false when no call is waiting: it was never registered, has
    /// already resolved, or timed out. Such replies are dropped.
    pub fn resolve(&self, correlation_id: &CorrelationId, reply: Envelope) -> bool {
        let Some((_, call)) = self.pending.remove(correlation_id) else {
            return false;
        };
        tracing::debug!(
            correlation_id = %correlation_id,
            destination = call.destination(),
            elapsed_ms = call.elapsed().as_millis() as u64,
            is_error = reply.is_error,
            "reply resolved pending call"
        );
        call.complete(PendingOutcome::Reply(reply))
    }

    /// Drop the pending call without completing it. Safe to call on an entry
    /// that is already gone.
    pub fn remove_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolve every outstanding call as cancelled. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.complete(PendingOutcome::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending calls");
        }
        cancelled
    }
}
