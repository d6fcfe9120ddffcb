//! Request validators for push deliveries.
//!
//! A validator decides whether a delivery is allowed in before anything else
//! looks at the body. All secret comparisons are constant-time.

use axum::http::{HeaderMap, HeaderName};
use binding::ConfigError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a delivery was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Credentials or signature are missing or wrong. Answered with 401.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The request is unusable. Answered with 400.
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Checks one delivery's headers and raw body.
pub trait WebhookValidator: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), Rejection>;
}

/// Accepts every delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidation;

impl WebhookValidator for NoValidation {
    fn verify(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), Rejection> {
        Ok(())
    }
}

/// Requires a header whose value equals a shared secret.
#[derive(Clone)]
pub struct SharedSecretValidator {
    header: HeaderName,
    secret: String,
}

impl std::fmt::Debug for SharedSecretValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretValidator")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl SharedSecretValidator {
    pub fn new(header: &str, secret: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            header: parse_header(header)?,
            secret: non_empty_secret(secret.into())?,
        })
    }
}

impl WebhookValidator for SharedSecretValidator {
    fn verify(&self, headers: &HeaderMap, _body: &[u8]) -> Result<(), Rejection> {
        let provided = headers
            .get(&self.header)
            .ok_or_else(|| Rejection::Unauthorized(format!("missing {} header", self.header)))?;
        if bool::from(provided.as_bytes().ct_eq(self.secret.as_bytes())) {
            Ok(())
        } else {
            Err(Rejection::Unauthorized("shared secret mismatch".to_string()))
        }
    }
}

/// Requires a header carrying the hex HMAC-SHA256 of the raw body, optionally
/// prefixed with `sha256=`.
#[derive(Clone)]
pub struct HmacSignatureValidator {
    header: HeaderName,
    keyed: HmacSha256,
}

impl std::fmt::Debug for HmacSignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSignatureValidator")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl HmacSignatureValidator {
    pub fn new(header: &str, secret: impl Into<String>) -> Result<Self, ConfigError> {
        let secret = non_empty_secret(secret.into())?;
        let keyed = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
            ConfigError::Invalid {
                field: "secret",
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            header: parse_header(header)?,
            keyed,
        })
    }

    /// Hex signature a sender would attach to `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        hex::encode(self.mac(body).finalize().into_bytes())
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(body);
        mac
    }
}

impl WebhookValidator for HmacSignatureValidator {
    fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), Rejection> {
        let value = headers
            .get(&self.header)
            .ok_or_else(|| Rejection::Unauthorized(format!("missing {} header", self.header)))?;
        let text = value
            .to_str()
            .map_err(|_| Rejection::Malformed("signature header is not ASCII".to_string()))?;
        let hex_signature = text.strip_prefix("sha256=").unwrap_or(text).trim();
        let signature = hex::decode(hex_signature)
            .map_err(|e| Rejection::Malformed(format!("signature is not hex: {e}")))?;

        self.mac(body)
            .verify_slice(&signature)
            .map_err(|_| Rejection::Unauthorized("signature mismatch".to_string()))
    }
}

fn parse_header(header: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(header.as_bytes()).map_err(|e| ConfigError::Invalid {
        field: "header",
        message: e.to_string(),
    })
}

fn non_empty_secret(secret: String) -> Result<String, ConfigError> {
    if secret.is_empty() {
        Err(ConfigError::Missing { field: "secret" })
    } else {
        Ok(secret)
    }
}
