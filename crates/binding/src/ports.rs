//! Port traits implemented by provider adapters and by hosts.
//!
//! Adapters implement [`ProviderClient`] (queues) or [`StreamClient`]
//! (streams); hosts implement [`EventHandler`] for their functions and, when
//! stream positions must survive restarts, [`CheckpointStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    AckToken, BatchSendReport, FailedEntry, HandlerError, MessageId, NormalizedEvent,
    OutboundMessage, Payload, ProviderError, RawMessage, ReceiveRequest, StreamBatch,
    StreamPosition,
};

// ---------------------------------------------------------------------------
// Provider side
// ---------------------------------------------------------------------------

/// Capability object for one queue.
///
/// One instance per queue, constructed from already-resolved credentials.
/// Implementations must be safe to share behind an `Arc` between a loop and
/// its workers.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Identifies the queue (its URL) for logs.
    fn source(&self) -> &str;

    /// Long-polls for up to `request.max_messages` messages.
    ///
    /// Returns an empty vector when the wait elapses with nothing to deliver.
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<RawMessage>, ProviderError>;

    /// Deletes the message identified by `token`.
    async fn ack(&self, token: &AckToken) -> Result<(), ProviderError>;

    /// Hides the message identified by `token` for `timeout` from now.
    async fn extend_visibility(
        &self,
        token: &AckToken,
        timeout: Duration,
    ) -> Result<(), ProviderError>;

    /// Sends one message, returning its provider-assigned id.
    async fn send(&self, message: OutboundMessage) -> Result<MessageId, ProviderError>;

    /// Sends up to ten messages in one call.
    ///
    /// Entry ids are the decimal index of each message within `messages`. The
    /// default implementation sends one at a time and reports per-entry results.
    async fn send_batch(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> Result<BatchSendReport, ProviderError> {
        let mut report = BatchSendReport::default();
        for (index, message) in messages.into_iter().enumerate() {
            let entry_id = index.to_string();
            match self.send(message).await {
                Ok(id) => report.successful.push((entry_id, id)),
                Err(err) => report.failed.push(FailedEntry {
                    entry_id,
                    code: err.code,
                    message: err.message,
                }),
            }
        }
        Ok(report)
    }
}

/// Capability object for one ordered stream.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Identifies the stream for logs.
    fn source(&self) -> &str;

    /// Reads up to `max_records` starting at `position` (or the stream's
    /// configured starting point when `None`), waiting up to `wait` when empty.
    async fn read(
        &self,
        position: Option<&StreamPosition>,
        max_records: u32,
        wait: Duration,
    ) -> Result<StreamBatch, ProviderError>;
}

/// Persists the last committed position of each stream.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed position for `stream`, if any.
    async fn load(&self, stream: &str) -> Result<Option<StreamPosition>, ProviderError>;

    /// Records `position` as fully handled for `stream`.
    async fn commit(&self, stream: &str, position: &StreamPosition) -> Result<(), ProviderError>;
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// One handler call: the event plus its projected body.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// The normalised event.
    pub event: NormalizedEvent,
    /// The event body in the registered projection.
    pub payload: Payload,
}

/// User code invoked once per event.
///
/// Handlers must tolerate duplicates: every engine here is at-least-once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. `Ok` acknowledges it; `Err` leaves it for redelivery.
    async fn handle(&self, invocation: Invocation) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
///
/// ```rust
/// use binding::{handler_fn, HandlerError, Invocation};
///
/// let handler = handler_fn(|invocation: Invocation| async move {
///     tracing::info!(id = %invocation.event.id(), "got event");
///     Ok::<(), HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

/// [`EventHandler`] backed by a closure; see [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, invocation: Invocation) -> Result<(), HandlerError> {
        (self.0)(invocation).await
    }
}
