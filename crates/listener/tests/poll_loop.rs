//! Behaviour of the queue consumer against a scripted provider.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use binding::{
    ConcurrencyMode, ConfigError, EnvelopeKind, LoopHealth, PollLoopState, ProviderError,
    TriggerConfig, TriggerName,
};
use common::{accept, raw, raw_with_receipt, reject, wait_until, RecordingHandler, ScriptedQueue};
use listener::{BackoffConfig, PollLoop, ShutdownCoordinator};

fn config() -> TriggerConfig {
    TriggerConfig {
        wait_time_seconds: 0,
        ..TriggerConfig::new("https://sqs.us-east-1.amazonaws.com/123456789012/orders")
    }
}

fn name() -> TriggerName {
    TriggerName::new("orders").unwrap()
}

fn fast_backoff(escalate_after: u32) -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(20),
        escalate_after,
    }
}

#[tokio::test]
async fn out_of_range_settings_are_rejected_before_any_receive() {
    let queue = ScriptedQueue::with_batches(vec![]);
    let handler = Arc::new(RecordingHandler::new(|_| async { accept() }));

    let too_many = TriggerConfig {
        max_batch_size: 11,
        ..config()
    };
    let err = PollLoop::new(name(), too_many, queue.clone(), handler.clone()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::OutOfRange {
            field: "max_batch_size",
            value: 11,
            ..
        }
    ));

    let too_long = TriggerConfig {
        wait_time_seconds: 21,
        ..config()
    };
    let err = PollLoop::new(name(), too_long, queue.clone(), handler).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::OutOfRange {
            field: "wait_time_seconds",
            ..
        }
    ));
    assert_eq!(queue.receives(), 0);
}

#[tokio::test]
async fn successful_messages_are_acknowledged_exactly_once() {
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", "hello")]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let seen = Arc::clone(&handler.seen);
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 1).await;
    // Let a few more empty polls happen to prove nothing is acked twice.
    wait_until(|| queue.receives() >= 3).await;
    assert!(coordinator.shutdown().await);
    let stats = task.await.unwrap();

    assert_eq!(queue.acks(), vec!["rh-m-1"]);
    assert_eq!(*seen.lock().unwrap(), vec!["hello"]);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(monitor.status().state, PollLoopState::Stopped);
}

#[tokio::test]
async fn failed_messages_are_never_acknowledged() {
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", "hello")]]);
    let handler = RecordingHandler::new(|_| async { reject("downstream unavailable") });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().failed == 1).await;
    coordinator.shutdown().await;
    let stats = task.await.unwrap();

    assert!(queue.acks().is_empty());
    assert_eq!(stats.acknowledged, 0);
}

#[tokio::test]
async fn only_successful_messages_in_a_batch_are_acknowledged() {
    let queue = ScriptedQueue::with_batches(vec![vec![
        raw("m-1", "good"),
        raw("m-2", "bad"),
        raw("m-3", "good"),
    ]]);
    let handler = RecordingHandler::new(|body| async move {
        if body == "bad" {
            reject("refused")
        } else {
            accept()
        }
    });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| {
        let stats = monitor.stats();
        stats.succeeded + stats.failed == 3
    })
    .await;
    coordinator.shutdown().await;
    task.await.unwrap();

    let mut acks = queue.acks();
    acks.sort();
    assert_eq!(acks, vec!["rh-m-1", "rh-m-3"]);
}

#[tokio::test]
async fn redelivered_messages_are_independent_invocations() {
    let queue = ScriptedQueue::with_batches(vec![
        vec![raw_with_receipt("m-1", "payload", "receipt-a")],
        vec![raw_with_receipt("m-1", "payload", "receipt-b")],
    ]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let started = Arc::clone(&handler.started);
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 2).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(queue.acks(), vec!["receipt-a", "receipt-b"]);
}

#[tokio::test]
async fn auto_ack_disabled_leaves_messages_alone() {
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", "hello")]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let cfg = TriggerConfig {
        auto_ack: false,
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().succeeded == 1).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert!(queue.acks().is_empty());
}

#[tokio::test]
async fn failed_acknowledgements_are_counted_not_retried() {
    let queue = ScriptedQueue::rejecting_acks(vec![vec![raw("m-1", "hello")]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().ack_failures == 1).await;
    coordinator.shutdown().await;
    let stats = task.await.unwrap();

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.acknowledged, 0);
    assert_eq!(stats.ack_failures, 1);
}

#[tokio::test]
async fn sequential_mode_handles_messages_in_receive_order() {
    let batch = (0..6).map(|i| raw(&format!("m-{i}"), &i.to_string())).collect();
    let queue = ScriptedQueue::with_batches(vec![batch]);
    let handler = RecordingHandler::new(|body: String| async move {
        // Early messages take longest, so any parallelism would reorder them.
        let n: u64 = body.parse().unwrap();
        tokio::time::sleep(Duration::from_millis(30 - n * 5)).await;
        accept()
    });
    let seen = Arc::clone(&handler.seen);
    let cfg = TriggerConfig {
        concurrency: ConcurrencyMode::Sequential,
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 6).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["0", "1", "2", "3", "4", "5"]);
    assert_eq!(
        queue.acks(),
        vec!["rh-m-0", "rh-m-1", "rh-m-2", "rh-m-3", "rh-m-4", "rh-m-5"]
    );
}

#[tokio::test]
async fn topic_envelopes_are_unwrapped_before_dispatch() {
    let envelope = serde_json::json!({
        "Type": "Notification",
        "MessageId": "sns-1",
        "TopicArn": "arn:aws:sns:us-east-1:123456789012:orders",
        "Message": "inner payload",
        "Timestamp": "2024-01-01T00:00:00.000Z"
    })
    .to_string();
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", &envelope)]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let seen = Arc::clone(&handler.seen);
    let cfg = TriggerConfig {
        envelope: EnvelopeKind::Auto,
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 1).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["inner payload"]);
    assert_eq!(queue.acks(), vec!["rh-m-1"]);
}

#[tokio::test]
async fn lookalike_bodies_in_auto_mode_are_handled_and_acknowledged() {
    let body = r#"{"Records":[{"eventSource":"aws:dynamodb","dynamodb":{}}]}"#;
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", body)]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let seen = Arc::clone(&handler.seen);
    let cfg = TriggerConfig {
        envelope: EnvelopeKind::Auto,
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 1).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![body]);
    assert_eq!(queue.acks(), vec!["rh-m-1"]);
}

#[tokio::test]
async fn malformed_envelopes_fail_without_reaching_the_handler() {
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", "not an envelope")]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let started = Arc::clone(&handler.started);
    let cfg = TriggerConfig {
        envelope: EnvelopeKind::Sns,
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().failed == 1).await;
    coordinator.shutdown().await;
    task.await.unwrap();

    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert!(queue.acks().is_empty());
}

#[tokio::test]
async fn shutdown_mid_batch_waits_for_in_flight_handlers() {
    let batch = (0..5)
        .map(|i| raw(&format!("m-{i}"), if i < 2 { "slow" } else { "fast" }))
        .collect();
    let queue = ScriptedQueue::with_batches(vec![batch]);
    let handler = RecordingHandler::new(|body: String| async move {
        if body == "slow" {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        accept()
    });
    let started = Arc::clone(&handler.started);
    let cfg = TriggerConfig {
        concurrency: ConcurrencyMode::Bounded(5),
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| started.load(Ordering::SeqCst) == 5).await;
    assert!(coordinator.shutdown().await);
    let stats = task.await.unwrap();

    assert_eq!(queue.receives(), 1);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.acknowledged, 5);
    assert_eq!(stats.abandoned, 0);
    assert_eq!(monitor.status().state, PollLoopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_abandons_overrunning_handlers() {
    let batch = (0..5)
        .map(|i| raw(&format!("m-{i}"), if i < 2 { "stuck" } else { "fast" }))
        .collect();
    let queue = ScriptedQueue::with_batches(vec![batch]);
    let handler = RecordingHandler::new(|body: String| async move {
        if body == "stuck" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        accept()
    });
    let started = Arc::clone(&handler.started);
    let cfg = TriggerConfig {
        concurrency: ConcurrencyMode::Bounded(5),
        handler_timeout_seconds: Some(7200),
        ..config()
    };
    let poll = PollLoop::new(name(), cfg, queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| started.load(Ordering::SeqCst) == 5 && monitor.stats().succeeded == 3).await;
    coordinator.shutdown().await;
    let stats = task.await.unwrap();

    assert_eq!(stats.abandoned, 2);
    assert_eq!(queue.acks().len(), 3);
    assert_eq!(monitor.status().state, PollLoopState::Stopped);
}

#[tokio::test]
async fn shutdown_before_start_never_receives() {
    let queue = ScriptedQueue::with_batches(vec![vec![raw("m-1", "hello")]]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler)).unwrap();
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let signal = coordinator.signal();
    coordinator.shutdown().await;
    poll.run(signal).await;

    assert_eq!(queue.receives(), 0);
    assert_eq!(monitor.status().state, PollLoopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn persistent_receive_failures_escalate_but_keep_polling() {
    let queue = ScriptedQueue::failing();
    let handler = RecordingHandler::new(|_| async { accept() });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler))
        .unwrap()
        .with_backoff(fast_backoff(3));
    let mut monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    monitor
        .wait_for_health(|health| matches!(health, LoopHealth::Fatal { .. }))
        .await;
    assert_eq!(monitor.status().state, PollLoopState::Running);
    assert!(monitor.stats().receive_failures >= 3);

    let seen = queue.receives();
    wait_until(|| queue.receives() >= seen + 3).await;
    assert!(matches!(
        monitor.status().health,
        LoopHealth::Fatal { consecutive_failures } if consecutive_failures > 3
    ));

    coordinator.shutdown().await;
    task.await.unwrap();
    assert_eq!(monitor.status().state, PollLoopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn a_successful_receive_restores_health() {
    let queue = ScriptedQueue::new(vec![
        Err(ProviderError::transient("Throttling", "slow down")),
        Err(ProviderError::transient("Throttling", "slow down")),
        Ok(vec![raw("m-1", "hello")]),
    ]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler))
        .unwrap()
        .with_backoff(fast_backoff(10));
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 1).await;
    assert_eq!(monitor.status().health, LoopHealth::Healthy);

    coordinator.shutdown().await;
    let stats = task.await.unwrap();
    assert_eq!(stats.receive_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn permanent_receive_errors_stay_on_the_back_off_schedule() {
    let queue = ScriptedQueue::new(vec![
        Err(ProviderError::permanent("QueueDoesNotExist", "gone")),
        Ok(vec![raw("m-1", "hello")]),
    ]);
    let handler = RecordingHandler::new(|_| async { accept() });
    let poll = PollLoop::new(name(), config(), queue.clone(), Arc::new(handler))
        .unwrap()
        .with_backoff(fast_backoff(10));
    let monitor = poll.monitor();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let task = coordinator.spawn(poll.run(coordinator.signal()));

    wait_until(|| monitor.stats().acknowledged == 1).await;
    assert_eq!(monitor.status().health, LoopHealth::Healthy);

    coordinator.shutdown().await;
    let stats = task.await.unwrap();
    assert_eq!(stats.receive_failures, 1);
}
