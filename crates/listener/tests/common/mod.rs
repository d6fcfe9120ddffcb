//! Test doubles shared by the listener integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use binding::{
    AckToken, Attributes, HandlerError, Invocation, MessageId, OutboundMessage, ProviderClient,
    ProviderError, RawMessage, ReceiveRequest, StreamBatch, StreamClient, StreamPosition,
};

/// How long an exhausted fake waits before answering an empty receive.
pub const IDLE_POLL: Duration = Duration::from_millis(20);

pub fn raw(id: &str, body: &str) -> RawMessage {
    raw_with_receipt(id, body, &format!("rh-{id}"))
}

pub fn raw_with_receipt(id: &str, body: &str, receipt: &str) -> RawMessage {
    RawMessage {
        id: MessageId::new(id).unwrap(),
        body: body.to_string(),
        attributes: Attributes::new(),
        message_attributes: Attributes::new(),
        ack_token: AckToken::new(receipt).unwrap(),
    }
}

/// Polls `condition` until it holds, panicking after a generous deadline.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Replays scripted receive results, then answers empty long polls forever
/// (or fails forever when built with [`ScriptedQueue::failing`]).
#[derive(Debug, Default)]
pub struct ScriptedQueue {
    script: Mutex<VecDeque<Result<Vec<RawMessage>, ProviderError>>>,
    fail_when_exhausted: bool,
    receives: AtomicUsize,
    acks: Mutex<Vec<AckToken>>,
    fail_acks: bool,
}

impl ScriptedQueue {
    pub fn new(script: Vec<Result<Vec<RawMessage>, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    pub fn with_batches(batches: Vec<Vec<RawMessage>>) -> Arc<Self> {
        Self::new(batches.into_iter().map(Ok).collect())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_when_exhausted: true,
            ..Self::default()
        })
    }

    pub fn rejecting_acks(batches: Vec<Vec<RawMessage>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(batches.into_iter().map(Ok).collect()),
            fail_acks: true,
            ..Self::default()
        })
    }

    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn acks(&self) -> Vec<String> {
        self.acks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.to_string())
            .collect()
    }
}

#[async_trait]
impl ProviderClient for ScriptedQueue {
    fn source(&self) -> &str {
        "scripted"
    }

    async fn receive(&self, _request: ReceiveRequest) -> Result<Vec<RawMessage>, ProviderError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None if self.fail_when_exhausted => {
                Err(ProviderError::transient("ServiceUnavailable", "queue is down"))
            }
            None => {
                tokio::time::sleep(IDLE_POLL).await;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, token: &AckToken) -> Result<(), ProviderError> {
        if self.fail_acks {
            return Err(ProviderError::permanent(
                "ReceiptHandleIsInvalid",
                "receipt expired",
            ));
        }
        self.acks.lock().unwrap().push(token.clone());
        Ok(())
    }

    async fn extend_visibility(&self, _: &AckToken, _: Duration) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send(&self, _message: OutboundMessage) -> Result<MessageId, ProviderError> {
        Ok(MessageId::generate())
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Serves fixed batches keyed by the requested position.
#[derive(Debug, Default)]
pub struct ScriptedStream {
    batches: Mutex<Vec<(Option<StreamPosition>, StreamBatch)>>,
    reads: Mutex<Vec<Option<StreamPosition>>>,
}

impl ScriptedStream {
    pub fn new(batches: Vec<(Option<StreamPosition>, StreamBatch)>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches),
            reads: Mutex::new(Vec::new()),
        })
    }

    /// Positions every read started from, in order.
    pub fn reads(&self) -> Vec<Option<String>> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.as_ref().map(|p| p.to_string()))
            .collect()
    }
}

#[async_trait]
impl StreamClient for ScriptedStream {
    fn source(&self) -> &str {
        "scripted-stream"
    }

    async fn read(
        &self,
        position: Option<&StreamPosition>,
        _max_records: u32,
        _wait: Duration,
    ) -> Result<StreamBatch, ProviderError> {
        self.reads.lock().unwrap().push(position.cloned());
        let found = self
            .batches
            .lock()
            .unwrap()
            .iter()
            .find(|(from, _)| from.as_ref() == position)
            .map(|(_, batch)| batch.clone());
        match found {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(IDLE_POLL).await;
                Ok(StreamBatch {
                    records: Vec::new(),
                    next_position: position.cloned(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Records every invocation's body and delegates the outcome to a closure.
pub struct RecordingHandler<F> {
    pub seen: Arc<Mutex<Vec<String>>>,
    pub started: Arc<AtomicUsize>,
    decide: F,
}

impl<F, Fut> RecordingHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(decide: F) -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicUsize::new(0)),
            decide,
        }
    }
}

#[async_trait]
impl<F, Fut> binding::EventHandler for RecordingHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, invocation: Invocation) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let body = invocation.payload.as_text().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(body.clone());
        (self.decide)(body).await
    }
}

pub fn accept() -> Result<(), HandlerError> {
    Ok(())
}

pub fn reject(reason: &str) -> Result<(), HandlerError> {
    Err(reason.to_string().into())
}
