//! The `sqs-bindings.toml` configuration file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! drain_timeout_secs = 30
//!
//! [aws]
//! region = "%AWS_REGION%"
//! endpoint = "http://localhost:4566"
//!
//! [[queue]]
//! name = "orders"
//! source = "%ORDERS_QUEUE_URL%"
//! max_batch_size = 10
//! handler = { type = "http", url = "http://localhost:7071/api/orders" }
//!
//! [[webhook]]
//! route = "orders-topic"
//! projection = "json"
//! handler = { type = "log" }
//! validator = { type = "hmac_sha256", header = "x-signature", secret = "%HOOK_SECRET%" }
//! ```
//!
//! Any string value written as `%NAME%` is replaced by the environment
//! variable `NAME` at load time; an unset or empty variable is an error.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use binding::{
    resolve_setting_with, ConfigError, Projection, RouteName, TriggerConfig, TriggerName,
    DEFAULT_HANDLER_TIMEOUT,
};
use listener::DEFAULT_DRAIN_TIMEOUT;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default, rename = "queue")]
    pub queues: Vec<QueueTrigger>,

    #[serde(default, rename = "webhook")]
    pub webhooks: Vec<WebhookRoute>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_secs()
}

/// Shared provider settings. Unset fields fall back to the environment.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// One `[[queue]]` table: a name, a handler, and the trigger settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueTrigger {
    pub name: String,
    pub handler: HandlerConfig,
    #[serde(flatten)]
    pub trigger: TriggerConfig,
}

/// One `[[webhook]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookRoute {
    pub route: String,
    pub handler: HandlerConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub projection: Projection,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl WebhookRoute {
    pub fn timeout(&self) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HANDLER_TIMEOUT)
    }
}

/// Where events go once a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum HandlerConfig {
    /// POST each event to a function endpoint; any 2xx is success.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Log each event and succeed.
    Log,
}

/// How a webhook route authenticates deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ValidatorConfig {
    #[default]
    None,
    SharedSecret {
        header: String,
        secret: String,
    },
    HmacSha256 {
        header: String,
        secret: String,
    },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Reads, resolves, and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&text, |name| std::env::var(name).ok())
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// Parses `text`, resolving `%NAME%` references through `lookup`.
    pub fn parse<F>(text: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(text)?;
        config.resolve_settings(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("server.bind: invalid address {:?}", self.server.bind))
    }

    fn resolve_settings<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |field: &str, value: &mut String| -> Result<(), ConfigError> {
            *value = resolve_setting_with(field, value, lookup)?;
            Ok(())
        };
        let resolve_opt = |field: &str, value: &mut Option<String>| -> Result<(), ConfigError> {
            if let Some(v) = value {
                *v = resolve_setting_with(field, v, lookup)?;
            }
            Ok(())
        };

        resolve("server.bind", &mut self.server.bind)?;
        resolve_opt("aws.region", &mut self.aws.region)?;
        resolve_opt("aws.endpoint", &mut self.aws.endpoint)?;
        resolve_opt("aws.access_key_id", &mut self.aws.access_key_id)?;
        resolve_opt("aws.secret_access_key", &mut self.aws.secret_access_key)?;
        resolve_opt("aws.session_token", &mut self.aws.session_token)?;

        for queue in &mut self.queues {
            resolve("queue.source", &mut queue.trigger.source)?;
            queue.handler.resolve_settings(&resolve)?;
        }
        for webhook in &mut self.webhooks {
            webhook.handler.resolve_settings(&resolve)?;
            match &mut webhook.validator {
                ValidatorConfig::None => {}
                ValidatorConfig::SharedSecret { secret, .. }
                | ValidatorConfig::HmacSha256 { secret, .. } => {
                    resolve("webhook.validator.secret", secret)?
                }
            }
        }
        Ok(())
    }

    /// Checks every trigger and route, and name uniqueness.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.server.drain_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "server.drain_timeout_secs",
                message: "must be greater than zero".to_string(),
            }
            .into());
        }
        if self.aws.access_key_id.is_some() != self.aws.secret_access_key.is_some() {
            bail!("aws.access_key_id and aws.secret_access_key must be set together");
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            let name = queue.trigger_name()?;
            if !names.insert(name.clone()) {
                bail!("duplicate queue trigger '{name}'");
            }
            queue
                .trigger
                .validate()
                .with_context(|| format!("queue {name}"))?;
        }

        let mut routes = HashSet::new();
        for webhook in &self.webhooks {
            let route = webhook.route_name()?;
            if !routes.insert(route.clone()) {
                bail!("duplicate webhook route '{route}'");
            }
            if webhook.timeout_seconds == Some(0) {
                return Err(ConfigError::Invalid {
                    field: "webhook.timeout_seconds",
                    message: "must be greater than zero".to_string(),
                })
                .with_context(|| format!("webhook {route}"));
            }
        }
        Ok(())
    }
}

impl QueueTrigger {
    pub fn trigger_name(&self) -> Result<TriggerName, ConfigError> {
        TriggerName::new(self.name.trim()).ok_or(ConfigError::Missing {
            field: "queue.name",
        })
    }
}

impl WebhookRoute {
    /// The route as a single URL path segment.
    pub fn route_name(&self) -> Result<RouteName, ConfigError> {
        let route = self.route.trim();
        if route.contains('/') {
            return Err(ConfigError::Invalid {
                field: "webhook.route",
                message: format!("{route:?} must be a single path segment"),
            });
        }
        RouteName::new(route).ok_or(ConfigError::Missing {
            field: "webhook.route",
        })
    }
}

impl HandlerConfig {
    fn resolve_settings<R>(&mut self, resolve: &R) -> Result<(), ConfigError>
    where
        R: Fn(&str, &mut String) -> Result<(), ConfigError>,
    {
        if let HandlerConfig::Http { url, headers } = self {
            resolve("handler.url", url)?;
            for value in headers.values_mut() {
                resolve("handler.headers", value)?;
            }
        }
        Ok(())
    }
}
