//! Connection health tracking for the completion API.
//!
//! Pure state: outcomes go in, a status comes out. The recovery probe and
//! the background monitor loop live on the executor, which owns the HTTP
//! side.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Consecutive failures at which the connection counts as degraded.
const DEGRADED_THRESHOLD: u32 = 3;
/// Consecutive failures at which the connection counts as failed.
const FAILED_THRESHOLD: u32 = 5;

/// Pause before using a degraded connection.
pub const DEGRADED_PAUSE: Duration = Duration::from_secs(5);
/// Shorter pause for the fast (pre-stream) health check.
pub const DEGRADED_PAUSE_FAST: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No outcome recorded yet.
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct HealthState {
    status: ConnectionStatus,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
}

/// Point-in-time view for the status report.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub auto_recovery: bool,
}

pub struct ConnectionHealth {
    state: Mutex<HealthState>,
    auto_recovery: bool,
}

impl ConnectionHealth {
    pub fn new(auto_recovery: bool) -> Self {
        Self {
            state: Mutex::new(HealthState {
                status: ConnectionStatus::Unknown,
                consecutive_failures: 0,
                last_success: None,
            }),
            auto_recovery,
        }
    }

    /// Any success heals the connection completely.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        let was = state.status;
        state.status = ConnectionStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_success = Some(Utc::now());
        if was != ConnectionStatus::Healthy && was != ConnectionStatus::Unknown {
            tracing::info!(previous = was.label(), "completion API connection recovered");
        }
    }

    /// One or two consecutive failures keep the previous status; three
    /// or four mean degraded; five or more mean failed.
    pub async fn record_failure(&self, error_kind: &str) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        state.status = match state.consecutive_failures {
            n if n >= FAILED_THRESHOLD => ConnectionStatus::Failed,
            n if n >= DEGRADED_THRESHOLD => ConnectionStatus::Degraded,
            _ => state.status,
        };
        tracing::warn!(
            error_kind,
            consecutive_failures = state.consecutive_failures,
            status = state.status.label(),
            "completion API failure recorded"
        );
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().await;
        HealthSnapshot {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            last_success: state.last_success,
            auto_recovery: self.auto_recovery,
        }
    }

    pub fn auto_recovery(&self) -> bool {
        self.auto_recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_unknown_with_zero_failures() {
        let health = ConnectionHealth::new(true);
        let snapshot = health.snapshot().await;
        assert_eq!(snapshot.status, ConnectionStatus::Unknown);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_success.is_none());
    }

    #[tokio::test]
    async fn thresholds_follow_consecutive_failures() {
        let health = ConnectionHealth::new(true);
        health.record_success().await;
        assert_eq!(health.status().await, ConnectionStatus::Healthy);

        // One or two failures keep the previous status.
        health.record_failure("timeout").await;
        health.record_failure("timeout").await;
        assert_eq!(health.status().await, ConnectionStatus::Healthy);

        health.record_failure("timeout").await;
        assert_eq!(health.status().await, ConnectionStatus::Degraded);
        health.record_failure("timeout").await;
        assert_eq!(health.status().await, ConnectionStatus::Degraded);

        health.record_failure("timeout").await;
        assert_eq!(health.status().await, ConnectionStatus::Failed);
        health.record_failure("timeout").await;
        assert_eq!(health.status().await, ConnectionStatus::Failed);
        assert_eq!(health.snapshot().await.consecutive_failures, 6);
    }

    #[tokio::test]
    async fn failure_count_is_zero_exactly_after_success() {
        let health = ConnectionHealth::new(true);
        health.record_failure("transport").await;
        assert!(health.snapshot().await.consecutive_failures > 0);

        health.record_success().await;
        let snapshot = health.snapshot().await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.status, ConnectionStatus::Healthy);
        assert!(snapshot.last_success.is_some());

        health.record_failure("transport").await;
        assert_eq!(health.snapshot().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn success_recovers_from_failed() {
        let health = ConnectionHealth::new(false);
        for _ in 0..7 {
            health.record_failure("timeout").await;
        }
        assert_eq!(health.status().await, ConnectionStatus::Failed);
        health.record_success().await;
        assert_eq!(health.status().await, ConnectionStatus::Healthy);
        assert_eq!(health.snapshot().await.consecutive_failures, 0);
    }
}
