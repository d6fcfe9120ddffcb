//! Output binding: sending a function's results to a queue.
//!
//! [`QueueOutput`] sends one value per call; [`QueueCollector`] buffers values
//! and flushes them in provider-sized batches. Both encode values the same
//! way (see [`encode_body`]).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::{ConfigError, MessageId, OutboundMessage, ProviderClient, ProviderError};

/// Largest number of entries one batch send may carry.
pub const MAX_SEND_BATCH: usize = 10;

/// Longest per-message delivery delay.
pub const MAX_DELAY_SECONDS: u32 = 900;

/// Options applied to every message an output binding sends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputOptions {
    /// Delay before the message becomes visible (`0..=900`).
    #[serde(default)]
    pub delay_seconds: u32,

    /// Message group id. Required for FIFO queues.
    #[serde(default)]
    pub message_group_id: Option<String>,

    /// When `false` on a FIFO queue, a deduplication id is generated per
    /// message; when `true`, the queue deduplicates on content.
    #[serde(default)]
    pub use_content_based_deduplication: bool,
}

impl OutputOptions {
    /// Checks the delay range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay_seconds > MAX_DELAY_SECONDS {
            return Err(ConfigError::OutOfRange {
                field: "delay_seconds",
                min: 0,
                max: u64::from(MAX_DELAY_SECONDS),
                value: u64::from(self.delay_seconds),
            });
        }
        Ok(())
    }

    fn message(&self, body: String) -> OutboundMessage {
        let deduplication_id = match (&self.message_group_id, self.use_content_based_deduplication)
        {
            (Some(_), false) => Some(MessageId::generate().to_string()),
            _ => None,
        };
        OutboundMessage {
            body,
            delay_seconds: self.delay_seconds,
            message_group_id: self.message_group_id.clone(),
            deduplication_id,
            ..OutboundMessage::default()
        }
    }
}

/// Encodes a value as a message body.
///
/// Strings are sent verbatim, `null` yields `None` (nothing is sent), and any
/// other value is sent as compact JSON.
pub fn encode_body<T: Serialize + ?Sized>(value: &T) -> Result<Option<String>, ProviderError> {
    let value = serde_json::to_value(value).map_err(|e| {
        ProviderError::permanent("SerializationFailed", format!("cannot encode value: {e}"))
    })?;
    Ok(match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// QueueOutput
// ---------------------------------------------------------------------------

/// Sends a function's return value to one queue.
pub struct QueueOutput {
    client: Arc<dyn ProviderClient>,
    options: OutputOptions,
}

impl QueueOutput {
    /// Creates an output binding, validating `options`.
    pub fn new(client: Arc<dyn ProviderClient>, options: OutputOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self { client, options })
    }

    /// Sends `value`, returning the message id, or `None` when `value` is null.
    #[instrument(skip(self, value), fields(queue = %self.client.source()))]
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Option<MessageId>, ProviderError> {
        let Some(body) = encode_body(value)? else {
            debug!("skipping output: value is null");
            return Ok(None);
        };
        let id = self.client.send(self.options.message(body)).await?;
        debug!(message_id = %id, "sent message");
        Ok(Some(id))
    }
}

// ---------------------------------------------------------------------------
// QueueCollector
// ---------------------------------------------------------------------------

/// Buffers outbound messages and sends them in batches of up to ten.
pub struct QueueCollector {
    client: Arc<dyn ProviderClient>,
    options: OutputOptions,
    pending: Vec<String>,
}

impl QueueCollector {
    /// Creates an empty collector, validating `options`.
    pub fn new(client: Arc<dyn ProviderClient>, options: OutputOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            client,
            options,
            pending: Vec::new(),
        })
    }

    /// Buffers `value`. Null values are ignored.
    pub fn add<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProviderError> {
        if let Some(body) = encode_body(value)? {
            self.pending.push(body);
        }
        Ok(())
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sends every buffered message, returning how many the queue accepted.
    ///
    /// Refused entries are logged and dropped. The buffer is empty afterwards
    /// unless a whole batch call fails, in which case the unsent remainder
    /// stays buffered and the error is returned.
    #[instrument(skip(self), fields(queue = %self.client.source(), pending = self.pending.len()))]
    pub async fn flush(&mut self) -> Result<usize, ProviderError> {
        let mut sent = 0;
        while !self.pending.is_empty() {
            let take = self.pending.len().min(MAX_SEND_BATCH);
            let chunk: Vec<OutboundMessage> = self.pending[..take]
                .iter()
                .map(|body| self.options.message(body.clone()))
                .collect();

            let report = self.client.send_batch(chunk).await?;
            self.pending.drain(..take);

            sent += report.successful.len();
            for failed in &report.failed {
                error!(
                    entry_id = %failed.entry_id,
                    code = %failed.code,
                    error = %failed.message,
                    "queue refused message"
                );
            }
        }
        debug!(sent, "flushed collector");
        Ok(sent)
    }
}
