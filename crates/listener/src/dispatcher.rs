//! Invokes a handler for one event and classifies the result.
//!
//! Shared by the poll loop, the stream loop, and the webhook registry. The
//! handler runs in its own task so that a panic is captured as a failure
//! instead of unwinding through the engine.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use binding::{
    DispatchOutcome, EventHandler, FailureCause, Invocation, NormalizedEvent, Payload, Projection,
};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn, Instrument};

/// Hands normalised events to one handler.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    projection: Projection,
    timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("projection", &self.projection)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher that projects bodies with `projection` and gives
    /// each invocation at most `timeout`.
    pub fn new(handler: Arc<dyn EventHandler>, projection: Projection, timeout: Duration) -> Self {
        Self {
            handler,
            projection,
            timeout,
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Projects the event body, invokes the handler, and classifies the result.
    ///
    /// A handler that outlives the timeout is aborted at its next suspension
    /// point and reported as [`FailureCause::Timeout`]. Code that never yields
    /// keeps running in the background; its result is discarded. Dropping the
    /// returned future (e.g. when a drain deadline passes) aborts the handler
    /// the same way.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(message_id = %event.id(), source_kind = ?event.source_kind())
    )]
    pub async fn dispatch(&self, event: NormalizedEvent) -> DispatchOutcome {
        let payload = match Payload::project(event.body(), self.projection) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "payload projection failed");
                return DispatchOutcome::failure(err);
            }
        };

        let handler = Arc::clone(&self.handler);
        let mut task = AbortOnDrop(tokio::spawn(
            async move { handler.handle(Invocation { event, payload }).await }.in_current_span(),
        ));

        let outcome = match tokio::time::timeout(self.timeout, &mut task.0).await {
            Ok(Ok(Ok(()))) => DispatchOutcome::Success,
            Ok(Ok(Err(err))) => DispatchOutcome::failure(FailureCause::Handler(err.to_string())),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let detail = panic_detail(join_err.into_panic());
                DispatchOutcome::failure(FailureCause::Handler(format!("handler panicked: {detail}")))
            }
            Ok(Err(_)) => DispatchOutcome::failure(FailureCause::Handler(
                "handler task was cancelled".to_string(),
            )),
            Err(_) => DispatchOutcome::failure(FailureCause::Timeout(self.timeout)),
        };

        match &outcome {
            DispatchOutcome::Success => debug!("handler succeeded"),
            DispatchOutcome::Failure { cause } => warn!(cause = %cause, "handler failed"),
        }
        outcome
    }
}

/// Aborts the handler task when the dispatch future completes or is dropped,
/// so an abandoned dispatch never leaves a detached handler behind.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use binding::{handler_fn, AckToken, Attributes, HandlerError, MessageId};

    use super::*;

    fn event(body: &str) -> NormalizedEvent {
        NormalizedEvent::queue(
            MessageId::new("m-1").unwrap(),
            body,
            Attributes::new(),
            "q",
            AckToken::new("r-1").unwrap(),
        )
    }

    fn dispatcher<H: EventHandler + 'static>(handler: H, projection: Projection) -> Dispatcher {
        Dispatcher::new(Arc::new(handler), projection, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn successful_handlers_yield_success() {
        let d = dispatcher(
            handler_fn(|_| async { Ok::<(), HandlerError>(()) }),
            Projection::Text,
        );
        assert_eq!(d.dispatch(event("x")).await, DispatchOutcome::Success);
    }

    #[tokio::test]
    async fn handler_errors_are_captured() {
        let d = dispatcher(
            handler_fn(|_| async { Err::<(), HandlerError>("boom".into()) }),
            Projection::Text,
        );
        assert_eq!(
            d.dispatch(event("x")).await,
            DispatchOutcome::Failure {
                cause: FailureCause::Handler("boom".to_string())
            }
        );
    }

    #[tokio::test]
    async fn panics_are_captured_as_handler_failures() {
        let d = dispatcher(
            handler_fn(|_| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), HandlerError>(())
            }),
            Projection::Text,
        );
        match d.dispatch(event("x")).await {
            DispatchOutcome::Failure {
                cause: FailureCause::Handler(detail),
            } => assert!(detail.contains("kaboom")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let d = Dispatcher::new(
            Arc::new(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), HandlerError>(())
            })),
            Projection::Text,
            Duration::from_secs(1),
        );
        assert_eq!(
            d.dispatch(event("x")).await,
            DispatchOutcome::Failure {
                cause: FailureCause::Timeout(Duration::from_secs(1))
            }
        );
    }

    #[tokio::test]
    async fn projection_failures_skip_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let d = dispatcher(
            handler_fn(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }),
            Projection::Json,
        );

        let outcome = d.dispatch(event("not json")).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failure {
                cause: FailureCause::Decode(_)
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
