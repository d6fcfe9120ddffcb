//! Trigger configuration and its validation rules.
//!
//! A [`TriggerConfig`] is deserialised from the host configuration file (or
//! built in code), validated once with [`TriggerConfig::validate`], and then
//! owned immutably by the loop that consumes it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Largest batch a single receive call may request.
pub const MAX_BATCH_SIZE: u32 = 10;

/// Longest server-side long-poll wait.
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

/// Longest visibility timeout a queue accepts (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

/// Upper bound on per-loop worker concurrency.
pub const MAX_CONCURRENCY: usize = 64;

/// Handler timeout used when neither an explicit timeout nor a visibility
/// timeout is configured. Matches the queue-side default visibility timeout.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// How the messages of one batch are handed to the dispatcher.
///
/// ## Ordering trade-off
///
/// Standard queues are unordered and nothing here changes that. For FIFO
/// queues, receive order is preserved **only** with [`ConcurrencyMode::Sequential`]
/// and only within one message group. `Bounded(n)` with `n > 1` may complete
/// (and acknowledge) messages out of order, which is usually fine for
/// throughput-oriented consumers and wrong for ordered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConcurrencySetting", into = "ConcurrencySetting")]
pub enum ConcurrencyMode {
    /// One message at a time, in receive order.
    Sequential,
    /// Up to `n` simultaneous handler invocations per loop.
    Bounded(usize),
}

impl Default for ConcurrencyMode {
    fn default() -> Self {
        Self::Bounded(4)
    }
}

impl ConcurrencyMode {
    /// Maximum number of simultaneous handler invocations.
    pub fn limit(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Bounded(n) => n,
        }
    }
}

/// Wire form of [`ConcurrencyMode`]: either `"sequential"` or a worker count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ConcurrencySetting {
    Named(String),
    Count(usize),
}

impl TryFrom<ConcurrencySetting> for ConcurrencyMode {
    type Error = String;

    fn try_from(value: ConcurrencySetting) -> Result<Self, Self::Error> {
        match value {
            ConcurrencySetting::Named(name) if name.eq_ignore_ascii_case("sequential") => {
                Ok(Self::Sequential)
            }
            ConcurrencySetting::Named(name) => Err(format!(
                "unknown concurrency mode '{name}' (expected \"sequential\" or a worker count)"
            )),
            ConcurrencySetting::Count(n) => Ok(Self::Bounded(n)),
        }
    }
}

impl From<ConcurrencyMode> for ConcurrencySetting {
    fn from(value: ConcurrencyMode) -> Self {
        match value {
            ConcurrencyMode::Sequential => Self::Named("sequential".to_string()),
            ConcurrencyMode::Bounded(n) => Self::Count(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope and projection
// ---------------------------------------------------------------------------

/// Which nested envelope, if any, a queue body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// The body is the payload.
    #[default]
    Raw,
    /// Detect a known envelope; fall back to [`EnvelopeKind::Raw`].
    Auto,
    /// A topic notification (`{"Type":"Notification","Message":...}`).
    Sns,
    /// An event-bus event (`{"detail-type":...,"detail":{...}}`).
    EventBridge,
    /// A storage notification (`{"Records":[{"s3":{...}}]}`).
    Storage,
}

/// The shape in which a handler receives the event body.
///
/// A closed set selected at registration time; see [`crate::Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// UTF-8 text.
    #[default]
    Text,
    /// Raw bytes.
    Bytes,
    /// Parsed JSON.
    Json,
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

/// Configuration for one pull-based trigger (queue or stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Queue URL or stream name.
    pub source: String,

    /// Messages requested per receive call (`1..=10`).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Long-poll wait per receive call (`0..=20`).
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: u32,

    /// Overrides the queue's visibility timeout for received messages.
    #[serde(default)]
    pub visibility_timeout_seconds: Option<u32>,

    /// Delete each message after its handler succeeds.
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,

    /// Per-loop handler concurrency.
    #[serde(default)]
    pub concurrency: ConcurrencyMode,

    /// Explicit per-invocation handler timeout.
    #[serde(default)]
    pub handler_timeout_seconds: Option<u64>,

    /// Nested envelope carried in message bodies.
    #[serde(default)]
    pub envelope: EnvelopeKind,

    /// Body projection handed to the handler.
    #[serde(default)]
    pub projection: Projection,

    /// Consecutive receive failures before the loop reports itself fatal.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_batch_size() -> u32 {
    MAX_BATCH_SIZE
}

fn default_wait_time_seconds() -> u32 {
    MAX_WAIT_TIME_SECONDS
}

fn default_auto_ack() -> bool {
    true
}

fn default_max_consecutive_failures() -> u32 {
    10
}

impl TriggerConfig {
    /// Creates a configuration for `source` with every other setting at its default.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            max_batch_size: default_max_batch_size(),
            wait_time_seconds: default_wait_time_seconds(),
            visibility_timeout_seconds: None,
            auto_ack: default_auto_ack(),
            concurrency: ConcurrencyMode::default(),
            handler_timeout_seconds: None,
            envelope: EnvelopeKind::default(),
            projection: Projection::default(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }

    /// Checks every invariant, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::Missing { field: "source" });
        }
        check_range(
            "max_batch_size",
            u64::from(self.max_batch_size),
            1,
            u64::from(MAX_BATCH_SIZE),
        )?;
        check_range(
            "wait_time_seconds",
            u64::from(self.wait_time_seconds),
            0,
            u64::from(MAX_WAIT_TIME_SECONDS),
        )?;
        if let Some(visibility) = self.visibility_timeout_seconds {
            check_range(
                "visibility_timeout_seconds",
                u64::from(visibility),
                0,
                u64::from(MAX_VISIBILITY_TIMEOUT_SECONDS),
            )?;
        }
        if let ConcurrencyMode::Bounded(n) = self.concurrency {
            check_range("concurrency", n as u64, 1, MAX_CONCURRENCY as u64)?;
        }
        if self.handler_timeout_seconds == Some(0) {
            return Err(ConfigError::Invalid {
                field: "handler_timeout_seconds",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "max_consecutive_failures",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Long-poll wait as a [`Duration`].
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.wait_time_seconds))
    }

    /// Visibility timeout override as a [`Duration`].
    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout_seconds
            .map(|s| Duration::from_secs(u64::from(s)))
    }

    /// Effective per-invocation handler timeout.
    ///
    /// An explicit timeout wins; otherwise a message may run for as long as
    /// it stays invisible; otherwise [`DEFAULT_HANDLER_TIMEOUT`].
    pub fn handler_timeout(&self) -> Duration {
        match (self.handler_timeout_seconds, self.visibility_timeout_seconds) {
            (Some(explicit), _) => Duration::from_secs(explicit),
            (None, Some(visibility)) if visibility > 0 => {
                Duration::from_secs(u64::from(visibility))
            }
            _ => DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}

// ---------------------------------------------------------------------------
// Setting resolution
// ---------------------------------------------------------------------------

/// Resolves a `%NAME%` setting reference from the process environment.
///
/// Values that are not wrapped in `%` are returned unchanged. `field` only
/// labels the error.
pub fn resolve_setting(field: &str, value: &str) -> Result<String, ConfigError> {
    resolve_setting_with(field, value, |name| std::env::var(name).ok())
}

/// Like [`resolve_setting`] with an injectable lookup.
pub fn resolve_setting_with<F>(field: &str, value: &str, lookup: F) -> Result<String, ConfigError>
where
    F: FnOnce(&str) -> Option<String>,
{
    let trimmed = value.trim();
    let reference = trimmed
        .strip_prefix('%')
        .and_then(|rest| rest.strip_suffix('%'))
        .filter(|name| !name.is_empty() && !name.contains('%'));

    match reference {
        None => Ok(value.to_string()),
        Some(name) => lookup(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::UnresolvedSetting {
                field: field.to_string(),
                name: name.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TriggerConfig::new("https://sqs.eu-west-1.amazonaws.com/1/orders");
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, ConcurrencyMode::Bounded(4));
        assert!(config.auto_ack);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let config = TriggerConfig {
            max_batch_size: 11,
            ..TriggerConfig::new("q")
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "max_batch_size",
                value: 11,
                ..
            })
        ));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let config = TriggerConfig {
            max_batch_size: 0,
            ..TriggerConfig::new("q")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn long_wait_is_rejected() {
        let config = TriggerConfig {
            wait_time_seconds: 21,
            ..TriggerConfig::new("q")
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "wait_time_seconds",
                ..
            })
        ));
    }

    #[test]
    fn empty_source_is_rejected() {
        assert_eq!(
            TriggerConfig::new("  ").validate(),
            Err(ConfigError::Missing { field: "source" })
        );
    }

    #[test]
    fn handler_timeout_prefers_explicit_then_visibility() {
        let mut config = TriggerConfig::new("q");
        assert_eq!(config.handler_timeout(), DEFAULT_HANDLER_TIMEOUT);

        config.visibility_timeout_seconds = Some(90);
        assert_eq!(config.handler_timeout(), Duration::from_secs(90));

        config.handler_timeout_seconds = Some(5);
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn concurrency_deserialises_from_name_or_count() {
        #[derive(Deserialize)]
        struct Wrapper {
            concurrency: ConcurrencyMode,
        }

        let named: Wrapper = serde_json::from_str(r#"{"concurrency":"sequential"}"#).unwrap();
        assert_eq!(named.concurrency, ConcurrencyMode::Sequential);

        let counted: Wrapper = serde_json::from_str(r#"{"concurrency":8}"#).unwrap();
        assert_eq!(counted.concurrency, ConcurrencyMode::Bounded(8));

        assert!(serde_json::from_str::<Wrapper>(r#"{"concurrency":"fast"}"#).is_err());
    }

    #[test]
    fn settings_resolve_from_environment_references() {
        let lookup = |name: &str| (name == "ORDERS_QUEUE").then(|| "https://q".to_string());

        assert_eq!(
            resolve_setting_with("queue_url", "%ORDERS_QUEUE%", lookup).unwrap(),
            "https://q"
        );
        assert_eq!(
            resolve_setting_with("queue_url", "literal", |_| None).unwrap(),
            "literal"
        );
        assert!(matches!(
            resolve_setting_with("queue_url", "%MISSING%", |_| None),
            Err(ConfigError::UnresolvedSetting { name, .. }) if name == "MISSING"
        ));
    }
}
