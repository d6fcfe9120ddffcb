//! Conversion of provider wire shapes into [`NormalizedEvent`]s.
//!
//! Three queue body shapes are understood besides plain payloads:
//!
//! | Envelope | Recognised by | Body after unwrapping |
//! |----------|---------------|-----------------------|
//! | SNS notification | `"Type":"Notification"` + `TopicArn` | the `Message` string |
//! | EventBridge event | `detail-type` | the raw `detail` JSON, byte-for-byte |
//! | S3 storage event | `Records` | unchanged; first record described in attributes |
//!
//! Only one level is unwrapped and the outer receipt handle is kept, so
//! acknowledging the event deletes the queue message that carried it.
//!
//! In [`EnvelopeKind::Auto`] mode a body that looks like an envelope but does
//! not parse as one is delivered unchanged. Only an explicitly configured
//! envelope turns a parse failure into a [`DecodeError`].

use std::collections::BTreeMap;

use binding::{
    Attributes, DecodeError, EnvelopeKind, MessageId, NormalizedEvent, RawMessage, StreamRecord,
};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

/// Attribute naming which envelope was unwrapped.
pub const ENVELOPE_ATTRIBUTE: &str = "envelope";

/// HTTP header carrying the SNS message type on push deliveries.
pub const SNS_MESSAGE_TYPE_HEADER: &str = "x-amz-sns-message-type";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Probe {
    #[serde(rename = "Type")]
    sns_type: Option<String>,
    #[serde(rename = "TopicArn")]
    topic_arn: Option<String>,
    #[serde(rename = "detail-type")]
    detail_type: Option<IgnoredAny>,
    #[serde(rename = "Records")]
    records: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    message_id: String,
    topic_arn: Option<String>,
    subject: Option<String>,
    message: String,
    timestamp: Option<String>,
    #[serde(default)]
    message_attributes: BTreeMap<String, SnsAttribute>,
    #[serde(rename = "SubscribeURL")]
    subscribe_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnsAttribute {
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct EventBridgeEnvelope<'a> {
    id: String,
    #[serde(rename = "detail-type")]
    detail_type: String,
    source: String,
    account: Option<String>,
    time: Option<String>,
    region: Option<String>,
    #[serde(borrow)]
    detail: &'a RawValue,
}

#[derive(Debug, Deserialize)]
struct StorageNotification {
    #[serde(rename = "Records")]
    records: Vec<StorageRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageRecord {
    event_name: String,
    event_time: Option<String>,
    s3: StorageEntity,
}

#[derive(Debug, Deserialize)]
struct StorageEntity {
    bucket: StorageBucket,
    object: StorageObject,
}

#[derive(Debug, Deserialize)]
struct StorageBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StorageObject {
    key: String,
    size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Queue messages
// ---------------------------------------------------------------------------

/// Normalises one received queue message.
///
/// Outer system and message attributes are merged into the event attributes
/// (message attributes win on a name clash); envelope attributes are added on
/// top. A malformed envelope is a [`DecodeError`], never a panic.
pub fn normalize_queue_message(
    raw: RawMessage,
    source: &str,
    envelope: EnvelopeKind,
) -> Result<NormalizedEvent, DecodeError> {
    let RawMessage {
        id,
        body,
        attributes: system,
        message_attributes,
        ack_token,
    } = raw;

    let mut attributes = system;
    attributes.extend(message_attributes);

    let body = match envelope {
        EnvelopeKind::Raw => body.into_bytes(),
        EnvelopeKind::Sns => unwrap_sns(&body, &mut attributes)?,
        EnvelopeKind::EventBridge => unwrap_event_bridge(&body, &mut attributes)?,
        EnvelopeKind::Storage => {
            describe_storage(&body, &mut attributes)?;
            body.into_bytes()
        }
        EnvelopeKind::Auto => unwrap_detected(body, &mut attributes),
    };

    Ok(NormalizedEvent::queue(id, body, attributes, source, ack_token))
}

/// Picks the envelope a body appears to carry, or [`EnvelopeKind::Raw`].
///
/// This only looks at marker keys; the body may still fail to parse as the
/// envelope returned.
pub fn detect_envelope(body: &str) -> EnvelopeKind {
    let Ok(probe) = serde_json::from_str::<Probe>(body) else {
        return EnvelopeKind::Raw;
    };
    if probe.sns_type.as_deref() == Some("Notification") && probe.topic_arn.is_some() {
        EnvelopeKind::Sns
    } else if probe.detail_type.is_some() {
        EnvelopeKind::EventBridge
    } else if probe.records.is_some() {
        EnvelopeKind::Storage
    } else {
        EnvelopeKind::Raw
    }
}

/// Unwraps whatever envelope the body carries, keeping it unchanged when the
/// detected envelope turns out to be malformed.
fn unwrap_detected(body: String, attributes: &mut Attributes) -> Vec<u8> {
    let kind = detect_envelope(&body);
    let unwrapped = match kind {
        EnvelopeKind::Sns => unwrap_sns(&body, attributes),
        EnvelopeKind::EventBridge => unwrap_event_bridge(&body, attributes),
        EnvelopeKind::Storage => {
            describe_storage(&body, attributes).map(|()| body.as_bytes().to_vec())
        }
        EnvelopeKind::Raw | EnvelopeKind::Auto => return body.into_bytes(),
    };
    match unwrapped {
        Ok(unwrapped) => unwrapped,
        Err(err) => {
            debug!(envelope = ?kind, error = %err.0, "body is not a well-formed envelope; delivering as-is");
            body.into_bytes()
        }
    }
}

fn unwrap_sns(body: &str, attributes: &mut Attributes) -> Result<Vec<u8>, DecodeError> {
    let envelope: SnsEnvelope = serde_json::from_str(body)
        .map_err(|e| DecodeError::new(format!("malformed SNS envelope: {e}")))?;
    if envelope.kind != "Notification" {
        return Err(DecodeError::new(format!(
            "expected an SNS Notification, got '{}'",
            envelope.kind
        )));
    }
    add_sns_attributes(&envelope, attributes);
    Ok(envelope.message.into_bytes())
}

fn add_sns_attributes(envelope: &SnsEnvelope, attributes: &mut Attributes) {
    attributes.insert(ENVELOPE_ATTRIBUTE.to_string(), "sns".to_string());
    attributes.insert("sns.message_id".to_string(), envelope.message_id.clone());
    if let Some(topic) = &envelope.topic_arn {
        attributes.insert("sns.topic_arn".to_string(), topic.clone());
    }
    if let Some(subject) = &envelope.subject {
        attributes.insert("sns.subject".to_string(), subject.clone());
    }
    if let Some(timestamp) = &envelope.timestamp {
        attributes.insert("sns.timestamp".to_string(), timestamp.clone());
    }
    for (name, attribute) in &envelope.message_attributes {
        attributes.insert(name.clone(), attribute.value.clone());
    }
}

fn unwrap_event_bridge(body: &str, attributes: &mut Attributes) -> Result<Vec<u8>, DecodeError> {
    let envelope: EventBridgeEnvelope<'_> = serde_json::from_str(body)
        .map_err(|e| DecodeError::new(format!("malformed EventBridge envelope: {e}")))?;

    attributes.insert(ENVELOPE_ATTRIBUTE.to_string(), "eventbridge".to_string());
    attributes.insert("eventbridge.id".to_string(), envelope.id);
    attributes.insert("eventbridge.source".to_string(), envelope.source);
    attributes.insert("eventbridge.detail_type".to_string(), envelope.detail_type);
    let optional = [
        ("eventbridge.account", envelope.account),
        ("eventbridge.time", envelope.time),
        ("eventbridge.region", envelope.region),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            attributes.insert(name.to_string(), value);
        }
    }
    Ok(envelope.detail.get().as_bytes().to_vec())
}

fn describe_storage(body: &str, attributes: &mut Attributes) -> Result<(), DecodeError> {
    let notification: StorageNotification = serde_json::from_str(body)
        .map_err(|e| DecodeError::new(format!("malformed storage notification: {e}")))?;
    let first = notification
        .records
        .first()
        .ok_or_else(|| DecodeError::new("storage notification has no records"))?;

    attributes.insert(ENVELOPE_ATTRIBUTE.to_string(), "storage".to_string());
    attributes.insert("storage.bucket".to_string(), first.s3.bucket.name.clone());
    attributes.insert("storage.key".to_string(), first.s3.object.key.clone());
    attributes.insert("storage.event_name".to_string(), first.event_name.clone());
    if let Some(time) = &first.event_time {
        attributes.insert("storage.event_time".to_string(), time.clone());
    }
    if let Some(size) = first.s3.object.size {
        attributes.insert("storage.size".to_string(), size.to_string());
    }
    attributes.insert(
        "storage.record_count".to_string(),
        notification.records.len().to_string(),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Stream records
// ---------------------------------------------------------------------------

/// Normalises one stream record. Stream events never carry an ack token.
pub fn normalize_stream_record(record: StreamRecord, source: &str) -> NormalizedEvent {
    let mut attributes = Attributes::new();
    attributes.insert("stream.position".to_string(), record.position.to_string());
    if let Some(key) = record.partition_key {
        attributes.insert("stream.partition_key".to_string(), key);
    }
    if let Some(arrived) = record.arrived_at {
        attributes.insert("stream.arrived_at".to_string(), arrived.to_string());
    }
    NormalizedEvent::stream_record(record.id, record.data, attributes, source)
}

// ---------------------------------------------------------------------------
// Push deliveries
// ---------------------------------------------------------------------------

/// What a push delivery turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum PushDelivery {
    /// The provider wants the subscription confirmed before delivering.
    SubscriptionConfirmation {
        /// URL to fetch to confirm.
        subscribe_url: String,
        /// Topic being subscribed to, when reported.
        topic_arn: Option<String>,
    },
    /// The provider reports that the subscription was removed.
    UnsubscribeConfirmation {
        /// Topic the subscription belonged to, when reported.
        topic_arn: Option<String>,
    },
    /// A regular event for the handler.
    Event(NormalizedEvent),
}

/// Classifies and normalises a push delivery on `route`.
///
/// SNS deliveries are recognised by the `x-amz-sns-message-type` header or a
/// `Type` field in the body; notifications unwrap their `Message`. Any other
/// body is delivered as-is under a generated id. `base_attributes` (typically
/// request headers of interest) are merged into the event attributes.
///
/// A malformed SNS body is a [`DecodeError`] only when the header declared
/// it. Without the header, a body that merely has an SNS-like `Type` field is
/// delivered as a plain event.
pub fn classify_push(
    route: &str,
    message_type: Option<&str>,
    body: &[u8],
    base_attributes: Attributes,
) -> Result<PushDelivery, DecodeError> {
    let body_type = serde_json::from_slice::<Probe>(body)
        .ok()
        .and_then(|probe| probe.sns_type)
        .filter(|t| is_sns_message_type(t));

    if message_type.is_none() && body_type.is_none() {
        return Ok(plain_push(route, body, base_attributes));
    }

    let envelope: SnsEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) if message_type.is_some() => {
            return Err(DecodeError::new(format!("malformed SNS delivery: {e}")))
        }
        Err(_) => return Ok(plain_push(route, body, base_attributes)),
    };
    if let Some(header) = message_type {
        if header != envelope.kind {
            return Err(DecodeError::new(format!(
                "message type header '{header}' does not match body type '{}'",
                envelope.kind
            )));
        }
    }

    match envelope.kind.as_str() {
        "SubscriptionConfirmation" => {
            match envelope.subscribe_url.filter(|url| !url.is_empty()) {
                Some(subscribe_url) => Ok(PushDelivery::SubscriptionConfirmation {
                    subscribe_url,
                    topic_arn: envelope.topic_arn,
                }),
                None if message_type.is_some() => Err(DecodeError::new(
                    "subscription confirmation without SubscribeURL",
                )),
                None => Ok(plain_push(route, body, base_attributes)),
            }
        }
        "UnsubscribeConfirmation" => Ok(PushDelivery::UnsubscribeConfirmation {
            topic_arn: envelope.topic_arn,
        }),
        "Notification" => {
            let mut attributes = base_attributes;
            add_sns_attributes(&envelope, &mut attributes);
            let id = MessageId::new(envelope.message_id.clone()).unwrap_or_else(MessageId::generate);
            Ok(PushDelivery::Event(NormalizedEvent::push(
                id,
                envelope.message.into_bytes(),
                attributes,
                route,
            )))
        }
        other => Err(DecodeError::new(format!("unknown SNS message type '{other}'"))),
    }
}

fn plain_push(route: &str, body: &[u8], attributes: Attributes) -> PushDelivery {
    PushDelivery::Event(NormalizedEvent::push(
        MessageId::generate(),
        body.to_vec(),
        attributes,
        route,
    ))
}

fn is_sns_message_type(value: &str) -> bool {
    matches!(
        value,
        "Notification" | "SubscriptionConfirmation" | "UnsubscribeConfirmation"
    )
}
