//! Stream consumer with checkpointing.
//!
//! Stream records carry no ack token. Instead the loop keeps a position and
//! commits it to a [`CheckpointStore`] once every record of a batch has been
//! handled successfully. If any record fails, the position stays where it
//! was and the whole batch is read again after a back-off, so records that
//! already succeeded are delivered again too.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use binding::{
    CheckpointStore, ConfigError, DispatchOutcome, EventHandler, LoopHealth, LoopStats,
    PollLoopState, ProviderError, RetryPolicy, StreamClient, StreamPosition, StreamRecord,
    TriggerConfig, TriggerName,
};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{BackoffConfig, BackoffState};
use crate::batch::run_batch;
use crate::dispatcher::Dispatcher;
use crate::health::{Counter, LoopMonitor, StatsCounters, StatusReporter};
use crate::normalizer::normalize_stream_record;
use crate::shutdown::ShutdownSignal;

/// Pull-based consumer for one stream trigger.
pub struct StreamLoop {
    name: TriggerName,
    config: TriggerConfig,
    client: Arc<dyn StreamClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    dispatcher: Dispatcher,
    backoff: BackoffConfig,
    reporter: StatusReporter,
}

impl std::fmt::Debug for StreamLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLoop")
            .field("name", &self.name)
            .field("source", &self.config.source)
            .finish_non_exhaustive()
    }
}

/// Outcome of handling one batch.
enum BatchResult {
    AllSucceeded,
    SomeFailed,
    Interrupted,
}

impl StreamLoop {
    pub fn new(
        name: TriggerName,
        config: TriggerConfig,
        client: Arc<dyn StreamClient>,
        checkpoints: Arc<dyn CheckpointStore>,
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
            checkpoints,
            dispatcher,
            backoff,
            reporter,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &TriggerName {
        &self.name
    }

    pub fn monitor(&self) -> LoopMonitor {
        self.reporter.monitor()
    }

    /// Runs until `shutdown` fires.
    #[instrument(
        name = "stream_loop",
        skip_all,
        fields(trigger = %self.name, stream = %self.config.source)
    )]
    pub async fn run(self, shutdown: ShutdownSignal) -> LoopStats {
        let stats = self.reporter.stats();
        if shutdown.is_cancelled() {
            self.reporter.set_state(PollLoopState::Stopped);
            return stats.snapshot();
        }
        self.reporter.set_state(PollLoopState::Running);

        let mut read_backoff = BackoffState::new(self.backoff.clone());
        let mut redelivery_backoff = BackoffState::new(self.backoff.clone());

        let Some(mut position) = self.load_checkpoint(&shutdown, &mut read_backoff).await else {
            return self.stop(&stats);
        };
        info!(position = ?position, "stream loop started");

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                read = self.client.read(
                    position.as_ref(),
                    self.config.max_batch_size,
                    self.config.wait_time(),
                ) => read,
            };

            let batch = match read {
                Ok(batch) => {
                    read_backoff.record_success();
                    self.reporter.set_health(LoopHealth::Healthy);
                    batch
                }
                Err(err) => {
                    stats.incr(Counter::ReceiveFailures);
                    let delay = self.on_read_failure(&mut read_backoff, &err);
                    if !sleep_unless_cancelled(&shutdown, delay).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.records.is_empty() {
                if let Some(next) = batch.next_position {
                    if position.as_ref() != Some(&next) {
                        self.commit(&next).await;
                        position = Some(next);
                    }
                }
                continue;
            }

            let count = batch.records.len();
            stats.add(Counter::Received, count as u64);
            debug!(count, "read stream batch");

            match self.handle_batch(batch.records, &shutdown, &stats).await {
                BatchResult::AllSucceeded => {
                    redelivery_backoff.record_success();
                    stats.add(Counter::Acknowledged, count as u64);
                    if let Some(next) = batch.next_position {
                        self.commit(&next).await;
                        position = Some(next);
                    }
                }
                BatchResult::SomeFailed => {
                    let delay = redelivery_backoff.record_failure(None);
                    warn!(
                        position = ?position,
                        delay_ms = delay.as_millis() as u64,
                        "batch had failures; re-reading from last committed position"
                    );
                    if !sleep_unless_cancelled(&shutdown, delay).await {
                        break;
                    }
                }
                BatchResult::Interrupted => break,
            }
        }

        self.stop(&stats)
    }

    /// Loads the starting position, retrying with back-off. `None` means
    /// shutdown fired first.
    async fn load_checkpoint(
        &self,
        shutdown: &ShutdownSignal,
        backoff: &mut BackoffState,
    ) -> Option<Option<StreamPosition>> {
        loop {
            let loaded = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                loaded = self.checkpoints.load(&self.config.source) => loaded,
            };
            match loaded {
                Ok(position) => {
                    backoff.record_success();
                    self.reporter.set_health(LoopHealth::Healthy);
                    return Some(position);
                }
                Err(err) => {
                    let delay = self.on_read_failure(backoff, &err);
                    if !sleep_unless_cancelled(shutdown, delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn handle_batch(
        &self,
        records: Vec<StreamRecord>,
        shutdown: &ShutdownSignal,
        stats: &Arc<StatsCounters>,
    ) -> BatchResult {
        let failures = Arc::new(AtomicUsize::new(0));
        let process = {
            let dispatcher = self.dispatcher.clone();
            let source = self.config.source.clone();
            let stats = Arc::clone(stats);
            let failures = Arc::clone(&failures);
            Arc::new(move |record: StreamRecord| {
                let dispatcher = dispatcher.clone();
                let source = source.clone();
                let stats = Arc::clone(&stats);
                let failures = Arc::clone(&failures);
                async move {
                    let event = normalize_stream_record(record, &source);
                    match dispatcher.dispatch(event).await {
                        DispatchOutcome::Success => stats.incr(Counter::Succeeded),
                        DispatchOutcome::Failure { .. } => {
                            stats.incr(Counter::Failed);
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        };

        let run = run_batch(
            records,
            self.config.concurrency,
            shutdown,
            &self.reporter,
            process,
        )
        .await;

        if run.interrupted {
            if run.abandoned > 0 {
                stats.add(Counter::Abandoned, run.abandoned as u64);
            }
            return BatchResult::Interrupted;
        }
        if failures.load(Ordering::SeqCst) > 0 {
            BatchResult::SomeFailed
        } else {
            BatchResult::AllSucceeded
        }
    }

    async fn commit(&self, position: &StreamPosition) {
        if let Err(err) = self.checkpoints.commit(&self.config.source, position).await {
            // The in-memory position still advances; a restart replays from
            // the last durable checkpoint.
            warn!(error = %err, %position, "checkpoint commit failed");
        }
    }

    fn on_read_failure(&self, backoff: &mut BackoffState, err: &ProviderError) -> Duration {
        let policy = err.retry_policy();
        let delay = backoff.record_policy(&policy);
        let consecutive_failures = backoff.consecutive_failures();
        if backoff.is_escalated() {
            self.reporter.set_health(LoopHealth::Fatal {
                consecutive_failures,
            });
            error!(error = %err, consecutive_failures, "stream read keeps failing");
        } else if policy == RetryPolicy::NonRetryable {
            self.reporter.set_health(LoopHealth::Degraded {
                consecutive_failures,
            });
            error!(error = %err, consecutive_failures, "stream read failed with a non-retryable error");
        } else {
            self.reporter.set_health(LoopHealth::Degraded {
                consecutive_failures,
            });
            warn!(error = %err, consecutive_failures, "stream read failed; backing off");
        }
        delay
    }

    fn stop(&self, stats: &StatsCounters) -> LoopStats {
        self.reporter.set_state(PollLoopState::Draining);
        self.reporter.set_state(PollLoopState::Stopped);
        info!("stream loop stopped");
        stats.snapshot()
    }
}

/// Sleeps for `delay`. Returns `false` if shutdown fired first.
async fn sleep_unless_cancelled(shutdown: &ShutdownSignal, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
