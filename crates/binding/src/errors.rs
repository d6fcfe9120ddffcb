//! Error and retry-policy types shared by every trigger engine.
//!
//! The taxonomy is deliberately small:
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`ProviderError`] | provider clients | receive: back-off; ack: logged and dropped |
//! | [`DecodeError`] | normaliser, projection | `Failure` outcome, message redelivered |
//! | [`HandlerError`] | user handlers | `Failure` outcome, message redelivered |
//! | [`ConfigError`] | trigger registration, config load | the loop never starts |
//!
//! Webhook authentication failures are modelled by the listener's `Rejection`
//! type since they only exist on the push path.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by provider errors so that a loop can pick its back-off without
/// knowing provider error codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// Retrying without operator intervention will not help (missing queue,
    /// denied access). Loops still retry on their back-off schedule.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Broad classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network failure, throttling, or a provider-side 5xx.
    Transient,
    /// The request itself is wrong: unknown queue, denied access, invalid
    /// parameter, or an expired receipt handle.
    Permanent,
}

/// A failed call against a remote queue, topic, or stream.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} provider error ({code}): {message}")]
pub struct ProviderError {
    /// Classification driving the retry policy.
    pub kind: ProviderErrorKind,
    /// Provider error code, e.g. `"ThrottlingException"` or `"http"`.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Delay requested by the provider (e.g. from a `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Creates a transient error.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a permanent error.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a provider-requested retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// The retry policy implied by this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.kind {
            ProviderErrorKind::Transient => RetryPolicy::Retryable {
                after: self.retry_after,
            },
            ProviderErrorKind::Permanent => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload errors
// ---------------------------------------------------------------------------

/// A payload could not be decoded into the expected envelope or projection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    /// Creates a decode error from any displayable detail.
    pub fn new(detail: impl std::fmt::Display) -> Self {
        Self(detail.to_string())
    }
}

/// Error returned by a user handler.
///
/// Boxed so handlers can return any error type; the engine only records its
/// `Display` output.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// A trigger or binding configuration is invalid.
///
/// Produced at registration or load time; a loop never starts with an invalid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric setting is outside its permitted range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// Name of the offending setting.
        field: &'static str,
        /// Inclusive lower bound.
        min: u64,
        /// Inclusive upper bound.
        max: u64,
        /// The rejected value.
        value: u64,
    },

    /// A required setting is absent or empty.
    #[error("{field} is required")]
    Missing {
        /// Name of the missing setting.
        field: &'static str,
    },

    /// A setting has an unusable value.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// A `%NAME%` reference could not be resolved from the environment.
    #[error("environment variable {name} referenced by {field} is not set")]
    UnresolvedSetting {
        /// Name of the setting containing the reference.
        field: String,
        /// Name of the environment variable.
        name: String,
    },
}
