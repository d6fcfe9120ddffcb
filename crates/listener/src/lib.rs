//! Trigger engines for queue bindings.
//!
//! Three ways for events to reach a handler:
//!
//! - [`PollLoop`] long-polls a queue through a [`binding::ProviderClient`],
//!   dispatches each message, and deletes it only after the handler
//!   succeeded. Failed messages are left for the provider to redeliver.
//!
//! - [`StreamLoop`] reads a partitioned stream through a
//!   [`binding::StreamClient`] and commits its position to a
//!   [`binding::CheckpointStore`] after a fully successful batch.
//!
//! - [`WebhookRegistry`] receives push deliveries on
//!   `POST /webhooks/{route}`, validates them, performs subscription
//!   handshakes, and dispatches everything else synchronously.
//!
//! ## Deployment Scenarios
//!
//! | Scenario | Engine | Notes |
//! |----------|--------|-------|
//! | Queue trigger | `PollLoop` + `sqs::SqsClient` | Ack after success only |
//! | Topic fan-out into a queue | `PollLoop` with `envelope = "sns"` or `"auto"` | Body is the inner `Message` |
//! | Topic push subscription | `WebhookRegistry` | Public HTTPS endpoint required |
//! | Stream trigger | `StreamLoop` + a `CheckpointStore` | Positions in memory by default |
//!
//! ## Architectural Layer
//!
//! **Engine.** Scheduling, back-off, draining, and HTTP handling live here.
//! Provider wire formats stay in adapter crates; the engines see only the
//! port traits from [`binding`].
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`poll_loop`] | Queue consumer |
//! | [`stream_loop`] | Stream consumer |
//! | [`webhook`] | Route table, validators, handshake, axum router |
//! | [`dispatcher`] | Handler invocation with timeout and panic capture |
//! | [`normalizer`] | Envelope unwrapping and push classification |
//! | [`backoff`] | Exponential back-off with full jitter |
//! | [`shutdown`] | Cancellation and drain coordination |
//! | [`health`] | Loop monitors and the health registry |
//! | [`checkpoint`] | In-memory `CheckpointStore` |

mod batch;

pub mod backoff;
pub mod checkpoint;
pub mod dispatcher;
pub mod health;
pub mod normalizer;
pub mod poll_loop;
pub mod shutdown;
pub mod stream_loop;
pub mod webhook;

pub use backoff::{BackoffConfig, BackoffState};
pub use checkpoint::InMemoryCheckpointStore;
pub use dispatcher::Dispatcher;
pub use health::{HealthRegistry, LoopMonitor, TriggerReport};
pub use normalizer::{
    classify_push, detect_envelope, normalize_queue_message, normalize_stream_record,
    PushDelivery, ENVELOPE_ATTRIBUTE, SNS_MESSAGE_TYPE_HEADER,
};
pub use poll_loop::PollLoop;
pub use shutdown::{ShutdownCoordinator, ShutdownSignal, DEFAULT_DRAIN_TIMEOUT};
pub use stream_loop::StreamLoop;
pub use webhook::{
    ConfirmError, ConfirmationPolicy, HmacSignatureValidator, HttpConfirmer, NoValidation,
    RegistryError, Rejection, SharedSecretValidator, SubscriptionConfirmer, WebhookRegistration,
    WebhookRegistry, WebhookResponse, WebhookValidator,
};
