//! Database connection management using sqlx

use crate::db::executor::{classify_sqlx_error, ErrorClass};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type DbPool = PgPool;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Initialize the shared connection pool
pub async fn init_pool(database_url: &str, settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(settings.min_connections)
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .connect(database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        "Database pool ready (min {}, max {})",
        settings.min_connections, settings.max_connections
    );
    Ok(pool)
}

/// Observed state of the shared pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionHealth {
    Unknown,
    Healthy,
    /// Transient network failures; the retry layer is expected to ride these out.
    Degraded { consecutive_failures: u32 },
    /// Non-network pool failure; the process should stop serving.
    Fatal { message: String },
}

/// Outcome of a single health probe or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Transient(String),
    Fatal(String),
}

impl ConnectionHealth {
    /// Next state after observing `outcome`. `Fatal` is terminal.
    pub fn observe(&self, outcome: &ProbeOutcome) -> ConnectionHealth {
        match (self, outcome) {
            (ConnectionHealth::Fatal { .. }, _) => self.clone(),
            (_, ProbeOutcome::Ok) => ConnectionHealth::Healthy,
            (ConnectionHealth::Degraded { consecutive_failures }, ProbeOutcome::Transient(_)) => {
                ConnectionHealth::Degraded {
                    consecutive_failures: consecutive_failures.saturating_add(1),
                }
            }
            (_, ProbeOutcome::Transient(_)) => ConnectionHealth::Degraded {
                consecutive_failures: 1,
            },
            (_, ProbeOutcome::Fatal(message)) => ConnectionHealth::Fatal {
                message: message.clone(),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionHealth::Fatal { .. })
    }

    pub fn is_serving(&self) -> bool {
        !self.is_fatal()
    }
}

impl ProbeOutcome {
    pub fn from_sqlx(result: Result<(), sqlx::Error>) -> Self {
        match result {
            Ok(()) => ProbeOutcome::Ok,
            Err(err) => match classify_sqlx_error(&err) {
                ErrorClass::Transient => ProbeOutcome::Transient(err.to_string()),
                _ => ProbeOutcome::Fatal(err.to_string()),
            },
        }
    }
}

/// Idle health probe running beside the request path.
pub struct HealthMonitor {
    pub handle: JoinHandle<()>,
    pub health: watch::Receiver<ConnectionHealth>,
}

impl HealthMonitor {
    /// Probe the pool every `interval` with `SELECT 1`, publishing each new state.
    pub fn spawn(pool: PgPool, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(ConnectionHealth::Unknown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let probe = sqlx::query("SELECT 1").execute(&pool).await.map(|_| ());
                let outcome = ProbeOutcome::from_sqlx(probe);
                let next = tx.borrow().observe(&outcome);
                match &next {
                    ConnectionHealth::Healthy => debug!("Database health probe ok"),
                    ConnectionHealth::Degraded { consecutive_failures } => warn!(
                        "Database health probe failed ({} in a row): {:?}",
                        consecutive_failures, outcome
                    ),
                    ConnectionHealth::Fatal { message } => {
                        error!("Database pool failed fatally: {}", message)
                    }
                    ConnectionHealth::Unknown => {}
                }
                let fatal = next.is_fatal();
                if tx.send(next).is_err() || fatal {
                    break;
                }
            }
        });
        Self { handle, health: rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_failures_accumulate() {
        let state = ConnectionHealth::Unknown
            .observe(&ProbeOutcome::Transient("connection refused".into()))
            .observe(&ProbeOutcome::Transient("timeout".into()));
        assert_eq!(state, ConnectionHealth::Degraded { consecutive_failures: 2 });
        assert!(state.is_serving());
    }

    #[test]
    fn test_recovery_resets_to_healthy() {
        let state = ConnectionHealth::Degraded { consecutive_failures: 4 }.observe(&ProbeOutcome::Ok);
        assert_eq!(state, ConnectionHealth::Healthy);
    }

    #[test]
    fn test_fatal_is_terminal() {
        let state = ConnectionHealth::Healthy
            .observe(&ProbeOutcome::Fatal("password authentication failed".into()))
            .observe(&ProbeOutcome::Ok);
        assert!(state.is_fatal());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(matches!(
            ProbeOutcome::from_sqlx(Err(sqlx::Error::PoolTimedOut)),
            ProbeOutcome::Transient(_)
        ));
        assert!(matches!(
            ProbeOutcome::from_sqlx(Err(sqlx::Error::PoolClosed)),
            ProbeOutcome::Fatal(_)
        ));
    }
}
