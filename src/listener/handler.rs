//! Typed handlers to type-erased bindings.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::HandlerError;
use crate::bus::{decode_payload, Envelope, PayloadFormat};
use crate::registry::{CommandHandlerFn, EventHandlerFn, HandlerFuture};

/// Erase an event handler taking a decoded `T`.
///
/// Decoding happens before the handler's future is created, so a payload that
/// does not fit `T` fails with [`HandlerError::DecodeFailed`] without running
/// the handler.
pub(crate) fn event_handler<T, F, Fut>(handler: F) -> EventHandlerFn
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |envelope: &Envelope| -> HandlerFuture<()> {
        let input = decode_payload::<T>(envelope);
        let handler = Arc::clone(&handler);
        Box::pin(async move { handler(input?).await })
    })
}

/// Erase a command handler taking a decoded `Req` and answering with `Resp`,
/// encoded in `format`.
pub(crate) fn command_handler<Req, Resp, F, Fut>(format: PayloadFormat, handler: F) -> CommandHandlerFn
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |envelope: &Envelope| -> HandlerFuture<Vec<u8>> {
        let input = decode_payload::<Req>(envelope);
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let output = handler(input?).await?;
            format
                .encode(&output)
                .map_err(|e| HandlerError::EncodeFailed(e.to_string()))
        })
    })
}

/// Run a handler future in its own task so a panic becomes
/// [`HandlerError::Panicked`] instead of taking down the consumer loop.
pub(crate) async fn run_isolated<T>(future: HandlerFuture<T>) -> Result<T, HandlerError>
where
    T: Send + 'static,
{
    match tokio::spawn(future).await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            Err(HandlerError::from_panic(join_error.into_panic()))
        }
        Err(join_error) => Err(HandlerError::other(join_error)),
    }
}
