//! Lifecycle and health vocabulary for pull-based loops.

use serde::{Deserialize, Serialize};

/// Lifecycle of one poll or stream loop.
///
/// `Created → Running → Draining → Stopped`. A loop that is shut down before
/// its first receive goes straight from `Created` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollLoopState {
    /// Registered, no receive issued yet.
    Created,
    /// Issuing receive calls.
    Running,
    /// Shutdown requested; no new receives, in-flight handlers finishing.
    Draining,
    /// Finished. Nothing is in flight.
    Stopped,
}

/// Receive-side health of a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopHealth {
    /// The last receive succeeded.
    Healthy,
    /// Receives are failing and back-off is active.
    Degraded {
        /// Failures since the last successful receive.
        consecutive_failures: u32,
    },
    /// Receives have failed at least the configured maximum number of times in
    /// a row. The loop keeps trying; whether to restart is the host's call.
    Fatal {
        /// Failures since the last successful receive.
        consecutive_failures: u32,
    },
}

/// Observable status of one loop: lifecycle plus health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStatus {
    /// Lifecycle state.
    pub state: PollLoopState,
    /// Receive-side health.
    pub health: LoopHealth,
}

impl LoopStatus {
    /// Status of a loop that has not started yet.
    pub fn created() -> Self {
        Self {
            state: PollLoopState::Created,
            health: LoopHealth::Healthy,
        }
    }

    /// `true` while the loop is running and not fatally failing.
    pub fn is_ready(&self) -> bool {
        self.state == PollLoopState::Running && !matches!(self.health, LoopHealth::Fatal { .. })
    }
}

/// Cumulative counters for one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoopStats {
    /// Messages or records handed to the dispatcher.
    pub received: u64,
    /// Dispatches that ended in `Success`.
    pub succeeded: u64,
    /// Dispatches that ended in `Failure`.
    pub failed: u64,
    /// Successful acknowledgements (or committed records, for streams).
    pub acknowledged: u64,
    /// Acknowledgement calls that failed.
    pub ack_failures: u64,
    /// Receive calls that failed.
    pub receive_failures: u64,
    /// Messages left unprocessed because shutdown overtook them.
    pub abandoned: u64,
}
