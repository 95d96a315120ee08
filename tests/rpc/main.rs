//! RPC integration tests.
//!
//! Two services on one in-memory broker: one registers command handlers,
//! the other calls them.

mod calls;
mod failures;
mod lifecycle;
