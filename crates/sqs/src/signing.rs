//! AWS Signature Version 4 for JSON-protocol POST requests.
//!
//! Only what the SQS client needs: a POST with an empty query string and a
//! fixed set of signed headers.

use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
    pub security_token: Option<String>,
}

/// Everything that goes into one signature.
#[derive(Debug)]
pub struct SigningRequest<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub url: &'a Url,
    pub content_type: &'a str,
    pub target: &'a str,
    pub body: &'a [u8],
    pub time: DateTime<Utc>,
}

/// Value of the `Host` header a client sends for `url`.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Signs a POST request.
pub fn sign(request: &SigningRequest<'_>) -> Result<SignedHeaders, InvalidLength> {
    let amz_date = request.time.format("%Y%m%dT%H%M%SZ").to_string();
    let date = request.time.format("%Y%m%d").to_string();
    let scope = format!(
        "{date}/{}/{}/aws4_request",
        request.region, request.service
    );

    let mut headers = vec![
        ("content-type", request.content_type.to_string()),
        ("host", host_header(request.url)),
        ("x-amz-date", amz_date.clone()),
        ("x-amz-target", request.target.to_string()),
    ];
    if let Some(token) = request.credentials.session_token() {
        headers.push(("x-amz-security-token", token.to_string()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let path = if request.url.path().is_empty() {
        "/"
    } else {
        request.url.path()
    };

    let canonical_request = format!(
        "POST\n{path}\n\n{canonical_headers}\n{signed_headers}\n{}",
        hex::encode(Sha256::digest(request.body))
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(
        request.credentials.secret_access_key(),
        &date,
        request.region,
        request.service,
    )?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            request.credentials.access_key_id()
        ),
        amz_date,
        security_token: request.credentials.session_token().map(str::to_string),
    })
}

/// Derives the per-day, per-region, per-service signing key.
pub fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
