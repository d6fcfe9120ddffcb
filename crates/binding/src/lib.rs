//! Core domain for the queue trigger bindings.
//!
//! This crate contains every value type, identifier, configuration rule, error
//! type, and port trait shared by the trigger engines. Provider adapters
//! implement the traits defined here; they never add engine rules.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** This crate has no I/O dependencies.
//! It defines *what* a provider or handler must supply; adapter crates define
//! *how*.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`TriggerName`, `AckToken`, etc.) |
//! | [`types`] | Messages, `NormalizedEvent`, `Payload`, `DispatchOutcome` |
//! | [`config`] | `TriggerConfig` and `%NAME%` setting resolution |
//! | [`status`] | Loop lifecycle, health, and counters |
//! | [`errors`] | Error taxonomy and retry policy |
//! | [`ports`] | `ProviderClient`, `StreamClient`, `CheckpointStore`, `EventHandler` |
//! | [`output`] | Output binding and batching collector |

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod output;
pub mod ports;
pub mod status;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{
    resolve_setting, resolve_setting_with, ConcurrencyMode, EnvelopeKind, Projection,
    TriggerConfig, DEFAULT_HANDLER_TIMEOUT, MAX_BATCH_SIZE, MAX_CONCURRENCY,
    MAX_VISIBILITY_TIMEOUT_SECONDS, MAX_WAIT_TIME_SECONDS,
};
pub use errors::{
    ConfigError, DecodeError, HandlerError, ProviderError, ProviderErrorKind, RetryPolicy,
};
pub use identifiers::{AckToken, MessageId, RouteName, StreamPosition, TriggerName};
pub use output::{encode_body, OutputOptions, QueueCollector, QueueOutput, MAX_SEND_BATCH};
pub use ports::{
    handler_fn, CheckpointStore, EventHandler, FnHandler, Invocation, ProviderClient,
    StreamClient,
};
pub use status::{LoopHealth, LoopStats, LoopStatus, PollLoopState};
pub use types::{
    Attributes, BatchSendReport, DispatchOutcome, FailedEntry, FailureCause, NormalizedEvent,
    OutboundMessage, Payload, RawMessage, ReceiveRequest, SourceKind, StreamBatch, StreamRecord,
    Timestamp,
};
