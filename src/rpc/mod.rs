//! RPC - awaitable command calls over the bus.
//!
//! ```text
//! caller                          bus                     command listener
//!   │ register pending(id)         │                             │
//!   │ publish command(id, reply_to)├────────────────────────────▶│
//!   │                              │      reply(id) on <key>.Reply
//!   │◀─────────────────────────────┤◀────────────────────────────┤
//!   │ resolve pending(id)          │                             │
//! ```

mod client;

pub use client::RpcClient;
