//! [`SqsClient`]: the [`ProviderClient`] for one SQS queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use binding::{
    AckToken, BatchSendReport, FailedEntry, MessageId, OutboundMessage, ProviderClient,
    ProviderError, RawMessage, ReceiveRequest, MAX_SEND_BATCH,
};
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::credentials::{resolve_endpoint, resolve_region, Credentials, KeyChain};
use crate::error::{from_response, from_transport, CredentialsError};
use crate::signing::{sign, SigningRequest};
use crate::wire::{
    self, BatchEntry, ChangeMessageVisibilityInput, DeleteMessageInput, ErrorBody,
    ReceiveMessageInput, ReceiveMessageOutput, SendMessageBatchInput, SendMessageBatchOutput,
    SendMessageInput, SendMessageOutput,
};

const SERVICE: &str = "sqs";

/// Timeout for calls that do not long-poll.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Added to the long-poll wait when bounding a receive call.
const RECEIVE_GRACE: Duration = Duration::from_secs(10);

/// Response of calls that return nothing of interest.
#[derive(Debug, Deserialize)]
struct Empty {}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`SqsClient`], resolving whatever was not given explicitly.
#[derive(Debug, Clone)]
pub struct SqsClientBuilder {
    queue_url: String,
    region: Option<String>,
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    provider: Option<SharedCredentialsProvider>,
    http: Option<reqwest::Client>,
}

impl SqsClientBuilder {
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sends requests here instead of the regional endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Asks `provider` for keys instead of the AWS default chain. Ignored
    /// when explicit credentials are set.
    pub fn credentials_provider(mut self, provider: impl ProvideCredentials + 'static) -> Self {
        self.provider = Some(SharedCredentialsProvider::new(provider));
        self
    }

    /// Shares an existing HTTP connection pool.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Resolves missing settings from the process environment.
    ///
    /// Without explicit or environment keys the client falls back to the AWS
    /// default chain, which is only consulted on the first call.
    pub fn build(self) -> Result<SqsClient, CredentialsError> {
        self.build_with(|name| std::env::var(name).ok())
    }

    /// Like [`build`](Self::build) with a custom variable source.
    pub fn build_with<F>(self, lookup: F) -> Result<SqsClient, CredentialsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let region = resolve_region(self.region.as_deref(), &self.queue_url, &lookup)?;
        let endpoint = resolve_endpoint(self.endpoint.as_deref(), &region)?;
        let keys = match (self.credentials, self.provider) {
            (Some(credentials), _) => KeyChain::fixed(credentials),
            (None, Some(provider)) => KeyChain::provider(&region, Some(provider)),
            (None, None) => match Credentials::from_lookup(&lookup) {
                Ok(credentials) => KeyChain::fixed(credentials),
                Err(CredentialsError::Missing("AWS_ACCESS_KEY_ID")) => {
                    KeyChain::provider(&region, None)
                }
                Err(err) => return Err(err),
            },
        };
        debug!(queue = %self.queue_url, %region, %endpoint, "built SQS client");

        Ok(SqsClient {
            http: self.http.unwrap_or_default(),
            queue_url: self.queue_url,
            region,
            endpoint,
            keys: Arc::new(keys),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Talks to one queue over the SQS JSON protocol.
#[derive(Clone)]
pub struct SqsClient {
    http: reqwest::Client,
    queue_url: String,
    region: String,
    endpoint: Url,
    keys: Arc<KeyChain>,
}

impl std::fmt::Debug for SqsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsClient")
            .field("queue_url", &self.queue_url)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl SqsClient {
    pub fn builder(queue_url: impl Into<String>) -> SqsClientBuilder {
        SqsClientBuilder {
            queue_url: queue_url.into(),
            region: None,
            endpoint: None,
            credentials: None,
            provider: None,
            http: None,
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Signs and sends one JSON-protocol call.
    async fn call<I, O>(&self, action: &str, input: &I, timeout: Duration) -> Result<O, ProviderError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let body = serde_json::to_vec(input).map_err(|e| {
            ProviderError::permanent("SerializationFailed", format!("cannot encode {action}: {e}"))
        })?;
        let credentials = self.keys.resolve().await.map_err(|e| {
            ProviderError::transient("CredentialsUnavailable", e.to_string())
        })?;
        let target = format!("{}{action}", wire::TARGET_PREFIX);
        let signed = sign(&SigningRequest {
            credentials: &credentials,
            region: &self.region,
            service: SERVICE,
            url: &self.endpoint,
            content_type: wire::CONTENT_TYPE,
            target: &target,
            body: &body,
            time: Utc::now(),
        })
        .map_err(|e| ProviderError::permanent("SigningFailed", e.to_string()))?;

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .timeout(timeout)
            .header(CONTENT_TYPE, wire::CONTENT_TYPE)
            .header("x-amz-target", &target)
            .header("x-amz-date", &signed.amz_date)
            .header(AUTHORIZATION, &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| from_transport(&e))?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let bytes = response.bytes().await.unwrap_or_default();
            let fault: ErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
            return Err(from_response(
                status,
                fault.kind.as_deref(),
                fault.message,
                retry_after,
            ));
        }

        let bytes = response.bytes().await.map_err(|e| from_transport(&e))?;
        let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(bytes).map_err(|e| {
            ProviderError::permanent("decode", format!("unexpected {action} response: {e}"))
        })
    }
}

#[async_trait]
impl ProviderClient for SqsClient {
    fn source(&self) -> &str {
        &self.queue_url
    }

    #[instrument(skip_all, fields(queue = %self.queue_url, max = request.max_messages))]
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<RawMessage>, ProviderError> {
        let input = ReceiveMessageInput::new(
            &self.queue_url,
            request.max_messages,
            request.wait_time.as_secs(),
            request.visibility_timeout.map(|d| d.as_secs()),
        );
        let output: ReceiveMessageOutput = self
            .call("ReceiveMessage", &input, request.wait_time + RECEIVE_GRACE)
            .await?;

        let messages: Vec<RawMessage> = output
            .messages
            .into_iter()
            .filter_map(|mut message| {
                let message_attributes = message.flat_message_attributes();
                let (Some(id), Some(ack_token)) = (
                    MessageId::new(message.message_id),
                    AckToken::new(message.receipt_handle),
                ) else {
                    warn!("dropping message without id or receipt handle");
                    return None;
                };
                Some(RawMessage {
                    id,
                    body: message.body,
                    attributes: message.attributes,
                    message_attributes,
                    ack_token,
                })
            })
            .collect();
        debug!(count = messages.len(), "received messages");
        Ok(messages)
    }

    async fn ack(&self, token: &AckToken) -> Result<(), ProviderError> {
        let input = DeleteMessageInput {
            queue_url: &self.queue_url,
            receipt_handle: token.as_str(),
        };
        let _: Empty = self
            .call("DeleteMessage", &input, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        token: &AckToken,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let input = ChangeMessageVisibilityInput {
            queue_url: &self.queue_url,
            receipt_handle: token.as_str(),
            visibility_timeout: timeout.as_secs(),
        };
        let _: Empty = self
            .call("ChangeMessageVisibility", &input, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(queue = %self.queue_url))]
    async fn send(&self, message: OutboundMessage) -> Result<MessageId, ProviderError> {
        let input = SendMessageInput {
            queue_url: &self.queue_url,
            message: message.into(),
        };
        let output: SendMessageOutput = self
            .call("SendMessage", &input, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        MessageId::new(output.message_id)
            .ok_or_else(|| ProviderError::permanent("decode", "SendMessage returned no id"))
    }

    #[instrument(skip_all, fields(queue = %self.queue_url, count = messages.len()))]
    async fn send_batch(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> Result<BatchSendReport, ProviderError> {
        if messages.is_empty() {
            return Ok(BatchSendReport::default());
        }
        if messages.len() > MAX_SEND_BATCH {
            return Err(ProviderError::permanent(
                "TooManyEntriesInBatchRequest",
                format!("{} entries exceed the limit of {MAX_SEND_BATCH}", messages.len()),
            ));
        }

        let input = SendMessageBatchInput {
            queue_url: &self.queue_url,
            entries: messages
                .into_iter()
                .enumerate()
                .map(|(index, message)| BatchEntry {
                    id: index.to_string(),
                    message: message.into(),
                })
                .collect(),
        };
        let output: SendMessageBatchOutput = self
            .call("SendMessageBatch", &input, DEFAULT_REQUEST_TIMEOUT)
            .await?;

        let mut report = BatchSendReport::default();
        for entry in output.successful {
            match MessageId::new(entry.message_id) {
                Some(id) => report.successful.push((entry.id, id)),
                None => report.failed.push(FailedEntry {
                    entry_id: entry.id,
                    code: "decode".to_string(),
                    message: "accepted entry carries no message id".to_string(),
                }),
            }
        }
        report
            .failed
            .extend(output.failed.into_iter().map(|entry| FailedEntry {
                entry_id: entry.id,
                code: entry.code,
                message: entry.message.unwrap_or_default(),
            }));
        Ok(report)
    }
}
