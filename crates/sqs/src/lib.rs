//! Amazon SQS adapter.
//!
//! [`SqsClient`] implements [`binding::ProviderClient`] over the SQS JSON
//! protocol (`application/x-amz-json-1.0`), signing every call with AWS
//! Signature Version 4. It is the only place that knows SQS wire shapes,
//! fault codes, or how credentials and regions are found.
//!
//! ```rust,no_run
//! use sqs::{Credentials, SqsClient};
//!
//! let client = SqsClient::builder("https://sqs.eu-west-1.amazonaws.com/123456789012/orders")
//!     .credentials(Credentials::new("AKID", "secret"))
//!     .build()?;
//! assert_eq!(client.region(), "eu-west-1");
//! # Ok::<(), sqs::CredentialsError>(())
//! ```
//!
//! ## Architectural Layer
//!
//! **Adapter.** Translates between the port traits and one provider.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`client`] | `SqsClient` and its builder |
//! | [`credentials`] | Key (environment or AWS default chain), region, and endpoint resolution |
//! | [`signing`] | Signature Version 4 |
//! | [`error`] | Fault classification |

pub mod client;
pub mod credentials;
pub mod error;
pub mod signing;

mod wire;

pub use client::{SqsClient, SqsClientBuilder, DEFAULT_REQUEST_TIMEOUT};
pub use credentials::{region_from_queue_url, resolve_endpoint, resolve_region, Credentials};
pub use error::CredentialsError;
