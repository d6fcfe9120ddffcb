//! JSON-protocol request and response shapes.

use std::collections::BTreeMap;

use binding::{Attributes, OutboundMessage};
use serde::{Deserialize, Serialize};

pub(crate) const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
pub(crate) const TARGET_PREFIX: &str = "AmazonSQS.";

/// Request every attribute on receive.
const ALL: &str = "All";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ReceiveMessageInput<'a> {
    pub queue_url: &'a str,
    pub max_number_of_messages: u32,
    pub wait_time_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<u64>,
    pub message_attribute_names: [&'static str; 1],
    pub message_system_attribute_names: [&'static str; 1],
}

impl<'a> ReceiveMessageInput<'a> {
    pub fn new(queue_url: &'a str, max: u32, wait_seconds: u64, visibility: Option<u64>) -> Self {
        Self {
            queue_url,
            max_number_of_messages: max,
            wait_time_seconds: wait_seconds,
            visibility_timeout: visibility,
            message_attribute_names: [ALL],
            message_system_attribute_names: [ALL],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DeleteMessageInput<'a> {
    pub queue_url: &'a str,
    pub receipt_handle: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ChangeMessageVisibilityInput<'a> {
    pub queue_url: &'a str,
    pub receipt_handle: &'a str,
    pub visibility_timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessageInput<'a> {
    pub queue_url: &'a str,
    #[serde(flatten)]
    pub message: MessageFields,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessageBatchInput<'a> {
    pub queue_url: &'a str,
    pub entries: Vec<BatchEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BatchEntry {
    pub id: String,
    #[serde(flatten)]
    pub message: MessageFields,
}

/// Fields shared by single and batch sends.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct MessageFields {
    pub message_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub message_attributes: BTreeMap<String, AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_deduplication_id: Option<String>,
}

impl From<OutboundMessage> for MessageFields {
    fn from(message: OutboundMessage) -> Self {
        Self {
            message_body: message.body,
            delay_seconds: (message.delay_seconds > 0).then_some(message.delay_seconds),
            message_attributes: message
                .attributes
                .into_iter()
                .map(|(name, value)| (name, AttributeValue::string(value)))
                .collect(),
            message_group_id: message.message_group_id,
            message_deduplication_id: message.deduplication_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AttributeValue {
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<String>,
}

impl AttributeValue {
    fn string(value: String) -> Self {
        Self {
            data_type: "String".to_string(),
            string_value: Some(value),
            binary_value: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ReceiveMessageOutput {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct WireMessage {
    pub message_id: String,
    pub receipt_handle: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub message_attributes: BTreeMap<String, AttributeValue>,
}

impl WireMessage {
    /// Message attributes flattened to strings; binary values stay base64.
    pub fn flat_message_attributes(&mut self) -> Attributes {
        std::mem::take(&mut self.message_attributes)
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .string_value
                    .or(value.binary_value)
                    .map(|v| (name, v))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessageOutput {
    pub message_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SendMessageBatchOutput {
    #[serde(default)]
    pub successful: Vec<BatchResultEntry>,
    #[serde(default)]
    pub failed: Vec<BatchErrorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BatchResultEntry {
    pub id: String,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct BatchErrorEntry {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Error body of a JSON-protocol fault.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(rename = "__type")]
    pub kind: Option<String>,
    #[serde(alias = "Message")]
    pub message: Option<String>,
}
