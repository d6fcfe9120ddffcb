//! Access keys, region, and endpoint resolution.
//!
//! Resolution order:
//!
//! | Setting | Sources, first match wins |
//! |---------|---------------------------|
//! | Keys | explicit → `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` (+ `AWS_SESSION_TOKEN`) → AWS default chain |
//! | Region | explicit → queue URL host → `AWS_REGION` → `AWS_DEFAULT_REGION` |
//! | Endpoint | explicit → `https://sqs.{region}.amazonaws.com/` |
//!
//! The AWS default chain covers profile files, web identity tokens, and
//! container and instance metadata. It is built on first use, and the keys it
//! returns are cached until shortly before they expire.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::Region;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use reqwest::Url;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::CredentialsError;

/// Provider keys are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Access key pair plus optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Reads the standard environment variables.
    pub fn from_env() -> Result<Self, CredentialsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CredentialsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let access_key_id =
            non_empty("AWS_ACCESS_KEY_ID").ok_or(CredentialsError::Missing("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = non_empty("AWS_SECRET_ACCESS_KEY")
            .ok_or(CredentialsError::Missing("AWS_SECRET_ACCESS_KEY"))?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty("AWS_SESSION_TOKEN"),
        })
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub(crate) fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl From<&aws_credential_types::Credentials> for Credentials {
    fn from(keys: &aws_credential_types::Credentials) -> Self {
        Self {
            access_key_id: keys.access_key_id().to_string(),
            secret_access_key: keys.secret_access_key().to_string(),
            session_token: keys.session_token().map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// Key source
// ---------------------------------------------------------------------------

/// Where a client gets the keys it signs with.
pub(crate) struct KeyChain {
    fixed: Option<Credentials>,
    region: String,
    provider: OnceCell<SharedCredentialsProvider>,
    cached: Mutex<Option<aws_credential_types::Credentials>>,
}

impl KeyChain {
    /// Always signs with `credentials`.
    pub(crate) fn fixed(credentials: Credentials) -> Self {
        Self {
            fixed: Some(credentials),
            region: String::new(),
            provider: OnceCell::new(),
            cached: Mutex::new(None),
        }
    }

    /// Asks `provider` for keys, or the AWS default chain for `region` when
    /// none is given.
    pub(crate) fn provider(region: &str, provider: Option<SharedCredentialsProvider>) -> Self {
        Self {
            fixed: None,
            region: region.to_string(),
            provider: OnceCell::new_with(provider),
            cached: Mutex::new(None),
        }
    }

    /// Keys valid for at least [`REFRESH_MARGIN`].
    pub(crate) async fn resolve(&self) -> Result<Credentials, CredentialsError> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        if let Some(cached) = self.fresh() {
            return Ok(Credentials::from(&cached));
        }

        let provider = self
            .provider
            .get_or_init(|| async {
                debug!(region = %self.region, "building the AWS default credential chain");
                let chain = DefaultCredentialsChain::builder()
                    .region(Region::new(self.region.clone()))
                    .build()
                    .await;
                SharedCredentialsProvider::new(chain)
            })
            .await;
        let loaded = provider
            .provide_credentials()
            .await
            .map_err(|e| CredentialsError::Unavailable(e.to_string()))?;
        debug!(expiry = ?loaded.expiry(), "loaded AWS credentials");

        let credentials = Credentials::from(&loaded);
        *self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(loaded);
        Ok(credentials)
    }

    fn fresh(&self) -> Option<aws_credential_types::Credentials> {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cached
            .as_ref()
            .filter(|keys| match keys.expiry() {
                Some(expiry) => expiry > SystemTime::now() + REFRESH_MARGIN,
                None => true,
            })
            .cloned()
    }
}

/// Region encoded in a queue URL host, e.g. `sqs.eu-west-1.amazonaws.com`
/// or the legacy `eu-west-1.queue.amazonaws.com`.
pub fn region_from_queue_url(queue_url: &str) -> Option<String> {
    let url = Url::parse(queue_url).ok()?;
    let host = url.host_str()?;
    let labels: Vec<&str> = host.split('.').collect();
    match labels.as_slice() {
        ["sqs", region, "amazonaws", ..] => Some((*region).to_string()),
        [region, "queue", "amazonaws", ..] => Some((*region).to_string()),
        _ => None,
    }
}

/// Picks the signing region for `queue_url`.
pub fn resolve_region<F>(
    explicit: Option<&str>,
    queue_url: &str,
    lookup: F,
) -> Result<String, CredentialsError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(region) = explicit.filter(|r| !r.is_empty()) {
        return Ok(region.to_string());
    }
    region_from_queue_url(queue_url)
        .or_else(|| lookup("AWS_REGION").filter(|r| !r.is_empty()))
        .or_else(|| lookup("AWS_DEFAULT_REGION").filter(|r| !r.is_empty()))
        .ok_or_else(|| CredentialsError::UnresolvedRegion(queue_url.to_string()))
}

/// Service endpoint for `region`, or the override when one is given.
pub fn resolve_endpoint(explicit: Option<&str>, region: &str) -> Result<Url, CredentialsError> {
    let raw = match explicit {
        Some(endpoint) => endpoint.to_string(),
        None => format!("https://sqs.{region}.amazonaws.com/"),
    };
    Url::parse(&raw).map_err(|e| CredentialsError::InvalidEndpoint(format!("{raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use aws_credential_types::provider::{error, future};

    use super::*;

    /// Hands out keys expiring at `expiry` and counts the calls.
    #[derive(Debug)]
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        expiry: Option<SystemTime>,
    }

    impl ProvideCredentials for CountingProvider {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            future::ProvideCredentials::ready(Ok(aws_credential_types::Credentials::new(
                format!("AKID{n}"),
                "secret",
                Some("token".to_string()),
                self.expiry,
                "counting",
            )))
        }
    }

    #[derive(Debug)]
    struct NoKeys;

    impl ProvideCredentials for NoKeys {
        fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
        where
            Self: 'a,
        {
            future::ProvideCredentials::ready(Err(error::CredentialsError::not_loaded(
                "nothing configured",
            )))
        }
    }

    fn counting(expiry: Option<SystemTime>) -> (KeyChain, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            calls: Arc::clone(&calls),
            expiry,
        };
        let chain = KeyChain::provider("us-east-1", Some(SharedCredentialsProvider::new(provider)));
        (chain, calls)
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn region_comes_from_modern_and_legacy_hosts() {
        assert_eq!(
            region_from_queue_url("https://sqs.eu-west-1.amazonaws.com/123456789012/orders"),
            Some("eu-west-1".to_string())
        );
        assert_eq!(
            region_from_queue_url("https://ap-south-1.queue.amazonaws.com/123456789012/orders"),
            Some("ap-south-1".to_string())
        );
        assert_eq!(
            region_from_queue_url("http://localhost:4566/000000000000/orders"),
            None
        );
    }

    #[test]
    fn explicit_region_wins_then_url_then_environment() {
        let lookup = env(&[("AWS_REGION", "us-west-2"), ("AWS_DEFAULT_REGION", "us-east-2")]);
        let url = "https://sqs.eu-west-1.amazonaws.com/1/q";
        assert_eq!(resolve_region(Some("ca-central-1"), url, &lookup).unwrap(), "ca-central-1");
        assert_eq!(resolve_region(None, url, &lookup).unwrap(), "eu-west-1");
        assert_eq!(
            resolve_region(None, "http://localhost:4566/0/q", &lookup).unwrap(),
            "us-west-2"
        );
        assert!(matches!(
            resolve_region(None, "http://localhost:4566/0/q", env(&[])),
            Err(CredentialsError::UnresolvedRegion(_))
        ));
    }

    #[test]
    fn keys_are_read_from_the_environment() {
        let creds = Credentials::from_lookup(env(&[
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "wJalrXUtnFEMI"),
            ("AWS_SESSION_TOKEN", "token"),
        ]))
        .unwrap();
        assert_eq!(creds.access_key_id(), "AKID");
        assert_eq!(creds.session_token(), Some("token"));
        assert!(!format!("{creds:?}").contains("wJalrXUtnFEMI"));

        assert!(matches!(
            Credentials::from_lookup(env(&[("AWS_ACCESS_KEY_ID", "AKID")])),
            Err(CredentialsError::Missing("AWS_SECRET_ACCESS_KEY"))
        ));
    }

    #[tokio::test]
    async fn provider_keys_are_cached_until_close_to_expiry() {
        let (chain, calls) = counting(Some(SystemTime::now() + Duration::from_secs(3600)));
        let first = chain.resolve().await.unwrap();
        let second = chain.resolve().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.session_token(), Some("token"));

        let (chain, calls) = counting(Some(SystemTime::now() + Duration::from_secs(60)));
        chain.resolve().await.unwrap();
        let refreshed = chain.resolve().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.access_key_id(), "AKID1");
    }

    #[tokio::test]
    async fn fixed_keys_never_consult_a_provider() {
        let chain = KeyChain::fixed(Credentials::new("AKID", "secret"));
        assert_eq!(chain.resolve().await.unwrap().access_key_id(), "AKID");
    }

    #[tokio::test]
    async fn provider_failures_are_unavailable_errors() {
        let chain = KeyChain::provider("us-east-1", Some(SharedCredentialsProvider::new(NoKeys)));
        assert!(matches!(
            chain.resolve().await,
            Err(CredentialsError::Unavailable(_))
        ));
    }

    #[test]
    fn default_endpoint_follows_the_region() {
        assert_eq!(
            resolve_endpoint(None, "us-east-1").unwrap().as_str(),
            "https://sqs.us-east-1.amazonaws.com/"
        );
        assert_eq!(
            resolve_endpoint(Some("http://localhost:4566"), "us-east-1")
                .unwrap()
                .as_str(),
            "http://localhost:4566/"
        );
    }
}
