//! Long-polling queue consumer.
//!
//! One [`PollLoop`] serves one trigger: it issues receive calls against a
//! [`ProviderClient`], normalises every message, dispatches it, and deletes
//! it only after the handler succeeded. Failed messages are left alone so the
//! provider redelivers them once their visibility timeout expires.
//!
//! ```text
//!   receive ──► normalize ──► dispatch ──► Success ──► ack (once)
//!      ▲                          │
//!      │                          └──────► Failure ──► no ack (redelivery)
//!      └── back-off on receive errors
//! ```

use std::sync::Arc;

use binding::{
    ConfigError, DispatchOutcome, EventHandler, LoopHealth, LoopStats, PollLoopState,
    ProviderClient, ProviderError, RawMessage, ReceiveRequest, RetryPolicy, TriggerConfig,
    TriggerName,
};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffConfig, BackoffState};
use crate::batch::run_batch;
use crate::dispatcher::Dispatcher;
use crate::health::{Counter, LoopMonitor, StatsCounters, StatusReporter};
use crate::normalizer::normalize_queue_message;
use crate::shutdown::ShutdownSignal;

/// Pull-based consumer for one queue trigger.
pub struct PollLoop {
    name: TriggerName,
    config: TriggerConfig,
    client: Arc<dyn ProviderClient>,
    dispatcher: Dispatcher,
    backoff: BackoffConfig,
    reporter: StatusReporter,
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("name", &self.name)
            .field("source", &self.config.source)
            .finish_non_exhaustive()
    }
}

impl PollLoop {
    /// Validates `config` and builds a loop. Nothing is received until
    /// [`run`](Self::run) is awaited.
    pub fn new(
        name: TriggerName,
        config: TriggerConfig,
        client: Arc<dyn ProviderClient>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dispatcher = Dispatcher::new(handler, config.projection, config.handler_timeout());
        let backoff = BackoffConfig {
            escalate_after: config.max_consecutive_failures,
            ..BackoffConfig::default()
        };
        let reporter = StatusReporter::new(name.clone());
        Ok(Self {
            name,
            config,
            client,
            dispatcher,
            backoff,
            reporter,
        })
    }

    /// Replaces the receive back-off settings. The escalation threshold is
    /// taken from the argument, not the trigger config.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &TriggerName {
        &self.name
    }

    /// A monitor that keeps observing the loop after `run` consumes it.
    pub fn monitor(&self) -> LoopMonitor {
        self.reporter.monitor()
    }

    /// Runs until `shutdown` fires and the current batch has drained.
    ///
    /// Receive failures never end the loop: they are counted, reported through
    /// the loop's health, and retried after back-off.
    #[instrument(
        name = "poll_loop",
        skip_all,
        fields(trigger = %self.name, queue = %self.config.source)
    )]
    pub async fn run(self, shutdown: ShutdownSignal) -> LoopStats {
        let stats = self.reporter.stats();
        if shutdown.is_cancelled() {
            self.reporter.set_state(PollLoopState::Stopped);
            return stats.snapshot();
        }

        self.reporter.set_state(PollLoopState::Running);
        info!(
            max_batch_size = self.config.max_batch_size,
            concurrency = self.config.concurrency.limit(),
            "poll loop started"
        );

        let worker = Arc::new(MessageWorker {
            client: Arc::clone(&self.client),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&stats),
        });
        let process = Arc::new(move |raw: RawMessage| {
            let worker = Arc::clone(&worker);
            async move { worker.process(raw).await }
        });

        let request = ReceiveRequest {
            max_messages: self.config.max_batch_size,
            wait_time: self.config.wait_time(),
            visibility_timeout: self.config.visibility_timeout(),
        };
        let mut backoff = BackoffState::new(self.backoff.clone());

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.client.receive(request) => received,
            };

            let messages = match received {
                Ok(messages) => {
                    if backoff.consecutive_failures() > 0 {
                        info!(
                            after_failures = backoff.consecutive_failures(),
                            "receive recovered"
                        );
                    }
                    backoff.record_success();
                    self.reporter.set_health(LoopHealth::Healthy);
                    messages
                }
                Err(err) => {
                    stats.incr(Counter::ReceiveFailures);
                    let delay = self.on_receive_failure(&mut backoff, &err);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if messages.is_empty() {
                continue;
            }
            debug!(count = messages.len(), "received batch");
            stats.add(Counter::Received, messages.len() as u64);

            let run = run_batch(
                messages,
                self.config.concurrency,
                &shutdown,
                &self.reporter,
                Arc::clone(&process),
            )
            .await;
            if run.abandoned > 0 {
                stats.add(Counter::Abandoned, run.abandoned as u64);
                warn!(
                    abandoned = run.abandoned,
                    "messages left for redelivery at shutdown"
                );
            }
            if run.interrupted {
                break;
            }
        }

        self.reporter.set_state(PollLoopState::Draining);
        self.reporter.set_state(PollLoopState::Stopped);
        let final_stats = stats.snapshot();
        info!(
            succeeded = final_stats.succeeded,
            failed = final_stats.failed,
            abandoned = final_stats.abandoned,
            "poll loop stopped"
        );
        final_stats
    }

    fn on_receive_failure(
        &self,
        backoff: &mut BackoffState,
        err: &ProviderError,
    ) -> std::time::Duration {
        let policy = err.retry_policy();
        let delay = backoff.record_policy(&policy);
        let consecutive_failures = backoff.consecutive_failures();
        if backoff.is_escalated() {
            self.reporter.set_health(LoopHealth::Fatal {
                consecutive_failures,
            });
            error!(
                error = %err,
                consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "receive keeps failing"
            );
        } else if policy == RetryPolicy::NonRetryable {
            self.reporter.set_health(LoopHealth::Degraded {
                consecutive_failures,
            });
            error!(
                error = %err,
                consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "receive failed with a non-retryable error; check the queue and credentials"
            );
        } else {
            self.reporter.set_health(LoopHealth::Degraded {
                consecutive_failures,
            });
            warn!(
                error = %err,
                consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "receive failed; backing off"
            );
        }
        delay
    }
}

/// Per-message work shared by every task of a batch.
struct MessageWorker {
    client: Arc<dyn ProviderClient>,
    dispatcher: Dispatcher,
    config: TriggerConfig,
    stats: Arc<StatsCounters>,
}

impl MessageWorker {
    async fn process(&self, raw: RawMessage) {
        let message_id = raw.id.clone();
        let ack_token = raw.ack_token.clone();

        let event = match normalize_queue_message(raw, &self.config.source, self.config.envelope) {
            Ok(event) => event,
            Err(err) => {
                self.stats.incr(Counter::Failed);
                warn!(%message_id, error = %err, "message could not be decoded; leaving for redelivery");
                return;
            }
        };

        match self.dispatcher.dispatch(event).await {
            DispatchOutcome::Success => {
                self.stats.incr(Counter::Succeeded);
                if !self.config.auto_ack {
                    return;
                }
                match self.client.ack(&ack_token).await {
                    Ok(()) => self.stats.incr(Counter::Acknowledged),
                    Err(err) => {
                        self.stats.incr(Counter::AckFailures);
                        warn!(%message_id, error = %err, "acknowledgement failed; message may be redelivered");
                    }
                }
            }
            DispatchOutcome::Failure { cause } => {
                self.stats.incr(Counter::Failed);
                debug!(%message_id, %cause, "message not acknowledged");
            }
        }
    }
}
