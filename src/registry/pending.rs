//! Pending calls - one slot per in-flight `call`, keyed by correlation id.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::correlation::CorrelationId;
use super::CallbackRegistry;
use crate::bus::Envelope;

/// How a pending call was completed.
#[derive(Debug)]
pub enum PendingOutcome {
    /// The correlated reply arrived.
    Reply(Envelope),
    /// The bus shut down first.
    Cancelled,
}

/// Result slot for one in-flight call.
pub(crate) struct PendingCall {
    destination: String,
    registered_at: Instant,
    slot: oneshot::Sender<PendingOutcome>,
}

impl PendingCall {
    pub(crate) fn new(destination: String, slot: oneshot::Sender<PendingOutcome>) -> Self {
        Self {
            destination,
            registered_at: Instant::now(),
            slot,
        }
    }

    pub(crate) fn destination(&self) -> &str {
        &self.destination
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Fill the slot. False when the caller stopped waiting.
    pub(crate) fn complete(self, outcome: PendingOutcome) -> bool {
        self.slot.send(outcome).is_ok()
    }
}

/// Removes a pending call when the awaiting future ends, however it ends.
///
/// Resolution already removes the entry, so dropping the guard afterwards is
/// a no-op.
pub struct PendingGuard<'a> {
    registry: &'a CallbackRegistry,
    correlation_id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(registry: &'a CallbackRegistry, correlation_id: CorrelationId) -> Self {
        Self {
            registry,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.registry.remove_pending(&self.correlation_id) {
            tracing::trace!(correlation_id = %self.correlation_id, "pending call abandoned");
        }
    }
}
