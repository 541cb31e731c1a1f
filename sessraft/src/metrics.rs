//! Server metrics for observability.
//!
//! Metrics are observed on a running server via `Raft::metrics()`, which
//! returns a watch channel updated after every externally observable change.
//! The `Wait` helper turns the channel into condition-based synchronization,
//! which the integration tests lean on heavily.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::Role;
use crate::membership::Configuration;
use crate::MemberId;

/// A set of metrics describing the current state of a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of this server.
    pub id: MemberId,
    /// The role of this server.
    pub role: Role,
    /// The current term.
    pub current_term: u64,
    /// The index of the last entry appended to the log.
    pub last_log_index: u64,
    /// The index of the highest entry known to be committed.
    pub commit_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<MemberId>,
    /// The membership configuration in effect.
    pub configuration: Configuration,
    /// The number of open client sessions.
    pub session_count: u64,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: MemberId) -> Self {
        Self {
            id,
            role: Role::Inactive,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            configuration: Configuration::new_initial(id),
            session_count: 0,
        }
    }
}

/// Error variants from waiting for a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on the metrics channel to satisfy a condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy `func`, or time out.
    #[tracing::instrument(level = "trace", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(id = latest.id, "done waiting for {}", msg.to_string());
                return Ok(latest);
            }

            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => {
                    return Err(WaitError::Timeout(
                        self.timeout,
                        format!("{} latest: {:?}", msg.to_string(), rx.borrow().clone()),
                    ));
                }
            }
        }
    }

    /// Wait for the server to assume the given role.
    pub async fn role(&self, want: Role, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.role == want,
            format!("{} wait for role {:?}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the server's leader hint to become `leader`.
    pub async fn current_leader(&self, leader: MemberId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} wait for leader {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the log to reach `index`.
    pub async fn log(&self, index: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= index,
            format!("{} wait for log index {}", msg.to_string(), index),
        )
        .await
    }

    /// Wait for the state machine to apply up to `index`.
    pub async fn applied(&self, index: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= index,
            format!("{} wait for applied index {}", msg.to_string(), index),
        )
        .await
    }
}
