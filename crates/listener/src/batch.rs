//! Runs one received batch under a concurrency mode and the shutdown signal.
//!
//! Items are processed either one at a time in receive order
//! ([`ConcurrencyMode::Sequential`]) or concurrently up to a limit. When
//! shutdown fires mid-batch no further items are started; those already
//! running get the drain timeout to finish and are aborted after that.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use binding::{ConcurrencyMode, PollLoopState};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::health::StatusReporter;
use crate::shutdown::ShutdownSignal;

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchRun {
    /// Items whose processing ran to completion.
    pub completed: usize,
    /// Items that never started or were aborted by the drain deadline.
    pub abandoned: usize,
    /// Shutdown fired before the batch finished.
    pub interrupted: bool,
}

pub(crate) async fn run_batch<I, F, Fut>(
    items: Vec<I>,
    mode: ConcurrencyMode,
    shutdown: &ShutdownSignal,
    reporter: &StatusReporter,
    process: Arc<F>,
) -> BatchRun
where
    I: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let total = items.len();
    let completed = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    match mode {
        ConcurrencyMode::Sequential => {
            let completed = Arc::clone(&completed);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                for item in items {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    process(item).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        ConcurrencyMode::Bounded(limit) => {
            let permits = Arc::new(Semaphore::new(limit.max(1)));
            for item in items {
                let permits = Arc::clone(&permits);
                let completed = Arc::clone(&completed);
                let shutdown = shutdown.clone();
                let process = Arc::clone(&process);
                tasks.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    if shutdown.is_cancelled() {
                        return;
                    }
                    process(item).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
    }

    let interrupted = loop {
        tokio::select! {
            biased;
            joined = tasks.join_next() => match joined {
                None => break false,
                Some(Err(err)) if err.is_panic() => error!(error = %err, "batch worker panicked"),
                Some(_) => {}
            },
            _ = shutdown.cancelled() => break true,
        }
    };

    if interrupted {
        reporter.set_state(PollLoopState::Draining);
        let drain_timeout = shutdown.drain_timeout();
        let drained = tokio::time::timeout(drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                in_flight = tasks.len(),
                "drain timeout elapsed; aborting in-flight handlers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    let completed = completed.load(Ordering::SeqCst);
    BatchRun {
        completed,
        abandoned: total.saturating_sub(completed),
        interrupted,
    }
}
