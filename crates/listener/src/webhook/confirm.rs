//! Subscription handshake: confirming a push subscription by fetching the
//! URL the provider sent.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tracing::{info, warn};

/// Host suffix a confirmation URL must end with unless overridden.
pub const DEFAULT_CONFIRMATION_HOST: &str = "amazonaws.com";

/// Confirmation failures.
#[derive(Debug, Error)]
pub enum ConfirmError {
    /// The URL is not one we are willing to fetch. Answered with 400.
    #[error("confirmation URL rejected: {0}")]
    Disallowed(String),
    /// Fetching the URL failed. Answered with 500.
    #[error("confirmation request failed: {0}")]
    Fetch(String),
}

/// Performs the confirmation fetch for a subscription handshake.
#[async_trait]
pub trait SubscriptionConfirmer: Send + Sync {
    async fn confirm(&self, subscribe_url: &str) -> Result<(), ConfirmError>;
}

/// Which confirmation URLs may be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Accepted hosts; each matches itself and any subdomain.
    pub allowed_hosts: Vec<String>,
    /// Only fetch `https` URLs.
    pub require_https: bool,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![DEFAULT_CONFIRMATION_HOST.to_string()],
            require_https: true,
        }
    }
}

impl ConfirmationPolicy {
    /// Parses `raw` and checks scheme and host.
    pub fn check(&self, raw: &str) -> Result<Url, ConfirmError> {
        let url = Url::parse(raw).map_err(|e| ConfirmError::Disallowed(format!("{raw}: {e}")))?;
        match url.scheme() {
            "https" => {}
            "http" if !self.require_https => {}
            other => {
                return Err(ConfirmError::Disallowed(format!(
                    "scheme '{other}' is not allowed"
                )))
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfirmError::Disallowed(format!("{raw}: no host")))?
            .to_ascii_lowercase();
        let allowed = self.allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.trim_start_matches('.').to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        });
        if allowed {
            Ok(url)
        } else {
            Err(ConfirmError::Disallowed(format!(
                "host '{host}' is not allowed"
            )))
        }
    }
}

/// Confirms subscriptions with a plain GET, remembering every URL it has
/// already confirmed so repeated handshakes do not fetch again.
#[derive(Debug)]
pub struct HttpConfirmer {
    client: reqwest::Client,
    policy: ConfirmationPolicy,
    confirmed: Mutex<HashSet<String>>,
}

impl Default for HttpConfirmer {
    fn default() -> Self {
        Self::new(reqwest::Client::new(), ConfirmationPolicy::default())
    }
}

impl HttpConfirmer {
    pub fn new(client: reqwest::Client, policy: ConfirmationPolicy) -> Self {
        Self {
            client,
            policy,
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    fn is_confirmed(&self, url: &str) -> bool {
        self.confirmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(url)
    }
}

#[async_trait]
impl SubscriptionConfirmer for HttpConfirmer {
    async fn confirm(&self, subscribe_url: &str) -> Result<(), ConfirmError> {
        let url = self.policy.check(subscribe_url)?;
        if self.is_confirmed(subscribe_url) {
            info!(host = url.host_str(), "subscription already confirmed");
            return Ok(());
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ConfirmError::Fetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, host = url.host_str(), "subscription confirmation refused");
            return Err(ConfirmError::Fetch(format!("confirmation returned {status}")));
        }

        self.confirmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subscribe_url.to_string());
        info!(host = url.host_str(), "subscription confirmed");
        Ok(())
    }
}
