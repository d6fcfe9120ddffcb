//! Value types flowing through the trigger engines.
//!
//! Provider clients produce [`RawMessage`]s and [`StreamRecord`]s; the
//! normaliser turns those (and webhook deliveries) into [`NormalizedEvent`]s;
//! the dispatcher projects the body into a [`Payload`] and reports a
//! [`DispatchOutcome`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AckToken, DecodeError, MessageId, Projection, StreamPosition};

/// String attributes attached to a message or event.
pub type Attributes = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Creates a [`Timestamp`] from milliseconds since the Unix epoch.
    ///
    /// Returns `None` for values outside the representable range.
    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Provider-side shapes
// ---------------------------------------------------------------------------

/// A message as returned by one receive call.
///
/// Consumed exactly once by a loop. The remote provider owns its lifetime: it
/// disappears when acknowledged, or becomes visible again when its visibility
/// timeout lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Provider-assigned message id.
    pub id: MessageId,
    /// Message body exactly as stored by the provider.
    pub body: String,
    /// Provider system attributes (e.g. `ApproximateReceiveCount`, `MessageGroupId`).
    pub attributes: Attributes,
    /// Sender-supplied message attributes.
    pub message_attributes: Attributes,
    /// Receipt handle for this particular receive.
    pub ack_token: AckToken,
}

/// Parameters of one long-poll receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on returned messages (`1..=10`).
    pub max_messages: u32,
    /// How long the provider may hold the call open waiting for messages.
    pub wait_time: Duration,
    /// Visibility timeout to apply to returned messages, if overriding the queue default.
    pub visibility_timeout: Option<Duration>,
}

/// One record read from an ordered stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Record identifier (typically the sequence number).
    pub id: MessageId,
    /// Record payload.
    pub data: Vec<u8>,
    /// Partition or shard key, when the stream has one.
    pub partition_key: Option<String>,
    /// Position of this record within the stream.
    pub position: StreamPosition,
    /// Time the stream accepted the record, if reported.
    pub arrived_at: Option<Timestamp>,
}

/// The result of one stream read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    /// Records in stream order.
    pub records: Vec<StreamRecord>,
    /// Position to resume from once every record above is handled.
    pub next_position: Option<StreamPosition>,
}

/// A message to be sent to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundMessage {
    /// Message body.
    pub body: String,
    /// Message attributes (sent as string attributes).
    pub attributes: Attributes,
    /// Delivery delay (`0..=900` seconds). FIFO queues ignore per-message delay.
    pub delay_seconds: u32,
    /// Message group for FIFO queues.
    pub message_group_id: Option<String>,
    /// Deduplication id for FIFO queues without content-based deduplication.
    pub deduplication_id: Option<String>,
}

impl OutboundMessage {
    /// Creates a message with the given body and no options.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

/// A batch entry the provider refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    /// Caller-assigned batch entry id.
    pub entry_id: String,
    /// Provider error code.
    pub code: String,
    /// Provider error message.
    pub message: String,
}

/// Per-entry result of a batch send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchSendReport {
    /// `(entry id, message id)` for every accepted entry.
    pub successful: Vec<(String, MessageId)>,
    /// Every refused entry.
    pub failed: Vec<FailedEntry>,
}

// ---------------------------------------------------------------------------
// Normalised event
// ---------------------------------------------------------------------------

/// Where a [`NormalizedEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Pulled from a queue; acknowledged individually.
    Queue,
    /// Pushed over HTTP; acknowledged by the response status.
    SubscriptionPush,
    /// Read from a stream; acknowledged by advancing a cursor.
    StreamRecord,
}

/// The single event shape every handler sees.
///
/// Fields are private so the acknowledgement invariant holds by construction:
/// the ack token is present exactly when `source_kind` is [`SourceKind::Queue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    id: MessageId,
    body: Vec<u8>,
    attributes: Attributes,
    received_at: Timestamp,
    source_kind: SourceKind,
    source: String,
    ack_token: Option<AckToken>,
}

impl NormalizedEvent {
    /// An event pulled from a queue.
    pub fn queue(
        id: MessageId,
        body: impl Into<Vec<u8>>,
        attributes: Attributes,
        source: impl Into<String>,
        ack_token: AckToken,
    ) -> Self {
        Self {
            id,
            body: body.into(),
            attributes,
            received_at: Timestamp::now(),
            source_kind: SourceKind::Queue,
            source: source.into(),
            ack_token: Some(ack_token),
        }
    }

    /// An event delivered over HTTP.
    pub fn push(
        id: MessageId,
        body: impl Into<Vec<u8>>,
        attributes: Attributes,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id,
            body: body.into(),
            attributes,
            received_at: Timestamp::now(),
            source_kind: SourceKind::SubscriptionPush,
            source: source.into(),
            ack_token: None,
        }
    }

    /// An event read from a stream.
    pub fn stream_record(
        id: MessageId,
        body: impl Into<Vec<u8>>,
        attributes: Attributes,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id,
            body: body.into(),
            attributes,
            received_at: Timestamp::now(),
            source_kind: SourceKind::StreamRecord,
            source: source.into(),
            ack_token: None,
        }
    }

    /// Event identifier.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Body bytes (the unwrapped payload when an envelope was present).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Event attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Single attribute lookup.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Time the engine accepted the event.
    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }

    /// Origin of the event.
    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    /// Queue URL, stream name, or webhook route the event arrived on.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Receipt handle; `Some` only for queue events.
    pub fn ack_token(&self) -> Option<&AckToken> {
        self.ack_token.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// The event body in the shape selected by a [`Projection`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Parsed JSON document.
    Json(serde_json::Value),
}

impl Payload {
    /// Projects `body` into the requested shape.
    pub fn project(body: &[u8], projection: Projection) -> Result<Self, DecodeError> {
        match projection {
            Projection::Bytes => Ok(Self::Bytes(body.to_vec())),
            Projection::Text => std::str::from_utf8(body)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|e| DecodeError::new(format!("body is not valid UTF-8: {e}"))),
            Projection::Json => serde_json::from_slice(body)
                .map(Self::Json)
                .map_err(|e| DecodeError::new(format!("body is not valid JSON: {e}"))),
        }
    }

    /// Returns the text, if this is a text projection.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the document, if this is a JSON projection.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a dispatch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    /// The payload could not be decoded or projected.
    Decode(String),
    /// The handler returned an error or panicked.
    Handler(String),
    /// The handler did not finish within its timeout.
    Timeout(Duration),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(detail) => write!(f, "decode error: {detail}"),
            Self::Handler(detail) => write!(f, "handler error: {detail}"),
            Self::Timeout(after) => write!(f, "handler timed out after {}ms", after.as_millis()),
        }
    }
}

impl From<DecodeError> for FailureCause {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err.0)
    }
}

/// Result of handing one event to a handler.
///
/// Drives delete-on-success for queues and the HTTP status for webhooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler returned successfully.
    Success,
    /// The handler did not succeed.
    Failure {
        /// Classification of the failure.
        cause: FailureCause,
    },
}

impl DispatchOutcome {
    /// Shorthand for a failed outcome.
    pub fn failure(cause: impl Into<FailureCause>) -> Self {
        Self::Failure {
            cause: cause.into(),
        }
    }

    /// Returns `true` for [`DispatchOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
