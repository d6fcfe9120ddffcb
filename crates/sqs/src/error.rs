//! Adapter errors and the mapping from SQS faults to [`ProviderError`].

use std::time::Duration;

use binding::ProviderError;
use reqwest::StatusCode;
use thiserror::Error;

/// Raised while assembling a client. The loop never starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    /// A required key is absent.
    #[error("missing AWS credential: {0}")]
    Missing(&'static str),

    /// No region was given, none is encoded in the queue URL, and none is
    /// set in the environment.
    #[error("cannot determine AWS region for queue {0}")]
    UnresolvedRegion(String),

    /// The endpoint override is not a URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The credentials provider could not produce keys.
    #[error("no AWS credentials available: {0}")]
    Unavailable(String),
}

/// Fault codes that clear up on their own.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "KmsThrottled",
    "RequestTimeout",
];

/// Strips the `com.amazonaws.sqs#` namespace from a JSON-protocol `__type`.
pub(crate) fn short_code(raw: &str) -> &str {
    raw.rsplit('#').next().unwrap_or(raw)
}

/// Classifies a non-2xx response.
pub(crate) fn from_response(
    status: StatusCode,
    code: Option<&str>,
    message: Option<String>,
    retry_after: Option<Duration>,
) -> ProviderError {
    let code = code.map(short_code).unwrap_or("http").to_string();
    let message = message.unwrap_or_else(|| format!("HTTP {status}"));
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || TRANSIENT_CODES.contains(&code.as_str());
    let error = if transient {
        ProviderError::transient(code, message)
    } else {
        ProviderError::permanent(code, message)
    };
    match retry_after {
        Some(after) => error.with_retry_after(after),
        None => error,
    }
}

/// Classifies a transport failure.
pub(crate) fn from_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_builder() {
        ProviderError::permanent("request", err.to_string())
    } else if err.is_decode() {
        ProviderError::permanent("decode", err.to_string())
    } else {
        ProviderError::transient("network", err.to_string())
    }
}
