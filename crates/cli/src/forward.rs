//! Event handlers the binary can run without user code linked in.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use binding::{Attributes, EventHandler, HandlerError, Invocation, Payload, SourceKind, Timestamp};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::HandlerConfig;

/// Longest error body quoted back in a handler failure.
const MAX_QUOTED_BODY: usize = 512;

/// Builds the handler a `[[queue]]` or `[[webhook]]` table asks for.
pub fn build_handler(
    config: &HandlerConfig,
    client: &reqwest::Client,
) -> Result<Arc<dyn EventHandler>> {
    Ok(match config {
        HandlerConfig::Http { url, headers } => {
            Arc::new(HttpForwardHandler::new(client.clone(), url, headers)?)
        }
        HandlerConfig::Log => Arc::new(LogHandler),
    })
}

// ---------------------------------------------------------------------------
// HTTP forwarding
// ---------------------------------------------------------------------------

/// JSON document POSTed for every event.
#[derive(Debug, Serialize)]
struct ForwardedEvent<'a> {
    id: &'a str,
    source: &'a str,
    source_kind: SourceKind,
    received_at: Timestamp,
    attributes: &'a Attributes,
    /// `text`, `json`, or `hex`.
    encoding: &'static str,
    data: serde_json::Value,
}

/// POSTs each event to a function endpoint. Any 2xx answer is success.
#[derive(Debug, Clone)]
pub struct HttpForwardHandler {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl HttpForwardHandler {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("handler.url: invalid URL {url:?}"))?;
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("handler.headers: invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("handler.headers: invalid value for {name}"))?;
            map.insert(name, value);
        }
        Ok(Self {
            client,
            url,
            headers: map,
        })
    }
}

#[async_trait]
impl EventHandler for HttpForwardHandler {
    async fn handle(&self, invocation: Invocation) -> Result<(), HandlerError> {
        let event = &invocation.event;
        let (encoding, data) = match invocation.payload {
            Payload::Text(text) => ("text", serde_json::Value::String(text)),
            Payload::Json(value) => ("json", value),
            Payload::Bytes(bytes) => ("hex", serde_json::Value::String(hex::encode(bytes))),
        };
        let document = ForwardedEvent {
            id: event.id().as_str(),
            source: event.source(),
            source_kind: event.source_kind(),
            received_at: event.received_at(),
            attributes: event.attributes(),
            encoding,
            data,
        };

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&document)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(message_id = %event.id(), %status, "function accepted event");
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_QUOTED_BODY {
            let mut end = MAX_QUOTED_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(format!("function returned {status}: {body}").into())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logs each event and succeeds. For trying a configuration locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, invocation: Invocation) -> Result<(), HandlerError> {
        let event = &invocation.event;
        info!(
            message_id = %event.id(),
            source = event.source(),
            bytes = event.body().len(),
            body = event.body_text().unwrap_or("<binary>"),
            "event received"
        );
        Ok(())
    }
}
