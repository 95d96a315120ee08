//! Consumer loop - pulls deliveries off a transport stream and hands them to
//! a callback until cancelled.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;
use super::transport::{DeliveryStream, TransportError};

/// Statistics from one consumer loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handed to the callback.
    pub deliveries: u64,
}

/// Handle to a background consumer task. Drop or call `stop()` to shut down.
pub struct ConsumerHandle {
    queue: String,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<ConsumerStats, TransportError>>>,
}

impl ConsumerHandle {
    pub(crate) fn spawn<F, Fut>(
        queue: String,
        stream: DeliveryStream,
        token: CancellationToken,
        on_delivery: F,
    ) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(run(queue.clone(), stream, token.clone(), on_delivery));
        Self {
            queue,
            token,
            handle: Some(handle),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once the loop has exited (cancelled, stream ended or failed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the consumer and wait for it to finish.
    ///
    /// Returns the transport error that ended the stream, if any.
    pub async fn stop(mut self) -> Result<ConsumerStats, TransportError> {
        self.token.cancel();
        self.wait().await
    }

    /// Wait for the consumer to end on its own.
    pub async fn join(mut self) -> Result<ConsumerStats, TransportError> {
        self.wait().await
    }

    /// Signal stop without waiting.
    pub fn signal_stop(&self) {
        self.token.cancel();
    }

    async fn wait(&mut self) -> Result<ConsumerStats, TransportError> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(TransportError::Other(e.to_string()))),
            None => Ok(ConsumerStats::default()),
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run<F, Fut>(
    queue: String,
    mut stream: DeliveryStream,
    token: CancellationToken,
    on_delivery: F,
) -> Result<ConsumerStats, TransportError>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut stats = ConsumerStats::default();
    tracing::debug!(queue = %queue, "consumer started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(queue = %queue, deliveries = stats.deliveries, "consumer stopped");
                break;
            }
            item = stream.recv() => match item {
                Some(Ok(envelope)) => {
                    stats.deliveries += 1;
                    on_delivery(envelope).await;
                }
                Some(Err(error)) => {
                    tracing::error!(queue = %queue, error = %error, "consumer stream failed");
                    return Err(error);
                }
                None => {
                    tracing::debug!(queue = %queue, "consumer stream ended");
                    break;
                }
            }
        }
    }

    Ok(stats)
}
