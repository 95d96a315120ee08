//! Counters for everything the bus does, including what it drops on purpose.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every component of one bus.
#[derive(Debug, Default)]
pub struct BusStats {
    events_published: AtomicU64,
    events_dispatched: AtomicU64,
    events_failed: AtomicU64,
    events_unmatched: AtomicU64,
    commands_handled: AtomicU64,
    commands_failed: AtomicU64,
    commands_malformed: AtomicU64,
    replies_published: AtomicU64,
    replies_resolved: AtomicU64,
    replies_dropped: AtomicU64,
    calls_timed_out: AtomicU64,
    calls_cancelled: AtomicU64,
    acks: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events published by this bus.
    pub events_published: u64,
    /// Event handler invocations that succeeded.
    pub events_dispatched: u64,
    /// Event handler invocations that failed.
    pub events_failed: u64,
    /// Event deliveries that matched no registered pattern.
    pub events_unmatched: u64,
    /// Commands whose handler succeeded.
    pub commands_handled: u64,
    /// Commands whose handler failed (an error reply was sent).
    pub commands_failed: u64,
    /// Command deliveries without a usable reply route.
    pub commands_malformed: u64,
    pub replies_published: u64,
    /// Replies that completed a pending call.
    pub replies_resolved: u64,
    /// Replies whose correlation id matched no pending call.
    pub replies_dropped: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    /// Deliveries acknowledged by this bus.
    pub acks: u64,
}

macro_rules! counters {
    ($($name:ident => $incr:ident),+ $(,)?) => {
        impl BusStats {
            $(
                pub(crate) fn $incr(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )+

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters! {
    events_published => event_published,
    events_dispatched => event_dispatched,
    events_failed => event_failed,
    events_unmatched => event_unmatched,
    commands_handled => command_handled,
    commands_failed => command_failed,
    commands_malformed => command_malformed,
    replies_published => reply_published,
    replies_resolved => reply_resolved,
    replies_dropped => reply_dropped,
    calls_timed_out => call_timed_out,
    calls_cancelled => call_cancelled,
    acks => acked,
}
