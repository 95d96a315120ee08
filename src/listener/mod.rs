//! Listeners - turn broker deliveries into handler invocations.
//!
//! - [`EventListener`]: topic patterns, any number of handlers per queue,
//!   no reply.
//! - [`CommandListener`]: one handler per exact key, exactly one reply and
//!   one acknowledgment per delivery.
//!
//! Handlers are plain typed async closures returning
//! `Result<_, HandlerError>`; decoding and encoding happen around them.

mod command;
mod error;
mod event;
mod handler;
mod reply;

pub use command::CommandListener;
pub use error::HandlerError;
pub use event::EventListener;
pub use reply::{reply_key, ErrorReply, REPLY_SUFFIX};

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::bus::ConsumerHandle;
use crate::error::Result;

async fn stop_consumers(consumers: &Mutex<HashMap<String, ConsumerHandle>>) -> Result<()> {
    let drained: Vec<(String, ConsumerHandle)> = consumers.lock().await.drain().collect();

    let mut first_failure = None;
    for (queue, handle) in drained {
        match handle.stop().await {
            Ok(stats) => {
                tracing::debug!(queue = %queue, deliveries = stats.deliveries, "listener stopped")
            }
            Err(error) => {
                tracing::warn!(queue = %queue, error = %error, "listener had failed");
                first_failure.get_or_insert(error);
            }
        }
    }

    match first_failure {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}
