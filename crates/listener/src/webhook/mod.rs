//! Push delivery: route table, request handling, and the HTTP surface.
//!
//! # Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`validate`] | [`WebhookValidator`] and the provided validators |
//! | [`confirm`] | Subscription handshake ([`SubscriptionConfirmer`]) |
//! | [`server`] | axum router for `POST /webhooks/{route}` and `GET /health` |
//!
//! [`WebhookRegistry::handle`] is transport-independent; the router is a
//! thin adapter over it.

pub mod confirm;
pub mod server;
pub mod validate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use binding::{
    Attributes, DispatchOutcome, EventHandler, Projection, RouteName, DEFAULT_HANDLER_TIMEOUT,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::normalizer::{classify_push, PushDelivery, SNS_MESSAGE_TYPE_HEADER};

pub use confirm::{
    ConfirmError, ConfirmationPolicy, HttpConfirmer, SubscriptionConfirmer,
    DEFAULT_CONFIRMATION_HOST,
};
pub use server::{router, serve};
pub use validate::{
    HmacSignatureValidator, NoValidation, Rejection, SharedSecretValidator, WebhookValidator,
};

/// Prefix of provider headers copied into event attributes.
const PROVIDER_HEADER_PREFIX: &str = "x-amz-sns-";

/// Route table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The route is already taken; the existing registration stays active.
    #[error("webhook route '{0}' is already registered")]
    DuplicateRoute(RouteName),
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Handler and validator bound to one route.
#[derive(Clone)]
pub struct WebhookRegistration {
    dispatcher: Dispatcher,
    validator: Arc<dyn WebhookValidator>,
}

impl std::fmt::Debug for WebhookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistration")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl WebhookRegistration {
    /// Text projection, the default handler timeout, no validation.
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            dispatcher: Dispatcher::new(handler, Projection::Text, DEFAULT_HANDLER_TIMEOUT),
            validator: Arc::new(NoValidation),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn WebhookValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.dispatcher = self.dispatcher.with_projection(projection);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_timeout(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Transport-independent answer to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

#[derive(Serialize)]
struct Acknowledgement<'a> {
    status: &'static str,
    id: &'a str,
}

impl WebhookResponse {
    fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn accepted(id: &str) -> Self {
        let body = serde_json::to_string(&Acknowledgement { status: "ok", id })
            .unwrap_or_else(|_| format!(r#"{{"status":"ok","id":"{id}"}}"#));
        Self {
            status: StatusCode::OK,
            content_type: "application/json",
            body,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Route table for push deliveries.
///
/// Registrations take effect immediately for concurrent requests. A request
/// clones its registration's `Arc` and releases the lock before dispatching,
/// so slow handlers never block registration.
pub struct WebhookRegistry {
    routes: RwLock<HashMap<RouteName, Arc<WebhookRegistration>>>,
    accepting: AtomicBool,
    confirmer: Arc<dyn SubscriptionConfirmer>,
}

impl std::fmt::Debug for WebhookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRegistry")
            .field("routes", &self.routes())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookRegistry {
    /// Registry confirming subscriptions with an [`HttpConfirmer`] under the
    /// default policy.
    pub fn new() -> Self {
        Self::with_confirmer(Arc::new(HttpConfirmer::default()))
    }

    pub fn with_confirmer(confirmer: Arc<dyn SubscriptionConfirmer>) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            confirmer,
        }
    }

    /// Binds `registration` to `route`. Fails if the route is taken.
    pub fn register(
        &self,
        route: RouteName,
        registration: WebhookRegistration,
    ) -> Result<(), RegistryError> {
        let mut routes = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if routes.contains_key(&route) {
            return Err(RegistryError::DuplicateRoute(route));
        }
        info!(%route, "webhook route registered");
        routes.insert(route, Arc::new(registration));
        Ok(())
    }

    /// Removes `route`. Removing an unknown route does nothing.
    pub fn unregister(&self, route: &RouteName) {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(route);
        if removed.is_some() {
            info!(%route, "webhook route removed");
        }
    }

    /// Registered routes, sorted.
    pub fn routes(&self) -> Vec<RouteName> {
        let mut routes: Vec<RouteName> = self
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        routes.sort();
        routes
    }

    /// Stops accepting deliveries; later requests are answered with 503.
    pub fn close(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("webhook registry closed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn lookup(&self, route: &str) -> Option<Arc<WebhookRegistration>> {
        let route = RouteName::new(route)?;
        self.routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&route)
            .cloned()
    }

    /// Handles one delivery on `route` end to end.
    #[instrument(name = "webhook", skip(self, headers, body), fields(body_len = body.len()))]
    pub async fn handle(&self, route: &str, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        if !self.is_accepting() {
            return WebhookResponse::text(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }
        let Some(registration) = self.lookup(route) else {
            debug!("unknown webhook route");
            return WebhookResponse::text(StatusCode::NOT_FOUND, format!("no route '{route}'"));
        };

        if let Err(rejection) = registration.validator.verify(headers, body) {
            warn!(%rejection, "webhook delivery rejected");
            let status = match rejection {
                Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                Rejection::Malformed(_) => StatusCode::BAD_REQUEST,
            };
            return WebhookResponse::text(status, rejection.to_string());
        }

        let message_type = headers
            .get(SNS_MESSAGE_TYPE_HEADER)
            .and_then(|value| value.to_str().ok());
        let delivery = match classify_push(route, message_type, body, header_attributes(headers)) {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(error = %err, "webhook delivery could not be decoded");
                return WebhookResponse::text(StatusCode::BAD_REQUEST, err.to_string());
            }
        };

        match delivery {
            PushDelivery::SubscriptionConfirmation {
                subscribe_url,
                topic_arn,
            } => match self.confirmer.confirm(&subscribe_url).await {
                Ok(()) => {
                    info!(topic_arn = topic_arn.as_deref(), "subscription handshake complete");
                    WebhookResponse::text(StatusCode::OK, "subscription confirmed")
                }
                Err(err @ ConfirmError::Disallowed(_)) => {
                    warn!(error = %err, "subscription confirmation refused");
                    WebhookResponse::text(StatusCode::BAD_REQUEST, err.to_string())
                }
                Err(err @ ConfirmError::Fetch(_)) => {
                    warn!(error = %err, "subscription confirmation failed");
                    WebhookResponse::text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
            },
            PushDelivery::UnsubscribeConfirmation { topic_arn } => {
                info!(topic_arn = topic_arn.as_deref(), "subscription removed by provider");
                WebhookResponse::text(StatusCode::OK, "unsubscribe acknowledged")
            }
            PushDelivery::Event(event) => {
                let id = event.id().clone();
                match registration.dispatcher.dispatch(event).await {
                    DispatchOutcome::Success => WebhookResponse::accepted(id.as_str()),
                    DispatchOutcome::Failure { cause } => {
                        WebhookResponse::text(StatusCode::INTERNAL_SERVER_ERROR, cause.to_string())
                    }
                }
            }
        }
    }
}

/// Provider headers and the content type, as event attributes.
fn header_attributes(headers: &HeaderMap) -> Attributes {
    let mut attributes = Attributes::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name.as_str().starts_with(PROVIDER_HEADER_PREFIX) {
            attributes.insert(format!("header.{}", name.as_str()), value.to_string());
        } else if name == axum::http::header::CONTENT_TYPE {
            attributes.insert("http.content_type".to_string(), value.to_string());
        }
    }
    attributes
}

#[cfg(test)]
mod tests {
    use binding::{handler_fn, HandlerError};

    use super::*;

    fn ok_handler() -> Arc<dyn EventHandler> {
        Arc::new(handler_fn(|_| async { Ok::<(), HandlerError>(()) }))
    }

    #[test]
    fn duplicate_routes_keep_the_first_registration() {
        let registry = WebhookRegistry::new();
        let route = RouteName::new("orders").unwrap();
        registry
            .register(route.clone(), WebhookRegistration::new(ok_handler()))
            .unwrap();

        assert_eq!(
            registry.register(route.clone(), WebhookRegistration::new(ok_handler())),
            Err(RegistryError::DuplicateRoute(route.clone()))
        );
        assert_eq!(registry.routes(), vec![route]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = WebhookRegistry::new();
        let route = RouteName::new("orders").unwrap();
        registry
            .register(route.clone(), WebhookRegistration::new(ok_handler()))
            .unwrap();

        registry.unregister(&route);
        registry.unregister(&route);
        assert!(registry.routes().is_empty());
    }

    #[tokio::test]
    async fn plain_deliveries_are_acknowledged_with_their_id() {
        let registry = WebhookRegistry::new();
        registry
            .register(
                RouteName::new("orders").unwrap(),
                WebhookRegistration::new(ok_handler()),
            )
            .unwrap();

        let response = registry.handle("orders", &HeaderMap::new(), b"hello").await;
        assert_eq!(response.status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn provider_headers_become_attributes() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-sns-topic-arn", "arn:aws:sns:us-east-1:1:t".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("authorization", "secret".parse().unwrap());

        let attributes = header_attributes(&headers);
        assert_eq!(
            attributes.get("header.x-amz-sns-topic-arn").map(String::as_str),
            Some("arn:aws:sns:us-east-1:1:t")
        );
        assert_eq!(
            attributes.get("http.content_type").map(String::as_str),
            Some("text/plain")
        );
        assert_eq!(attributes.len(), 2);
    }
}
