//! Background sweep of expired OAuth states and idle connection locks.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::repositories::OAuthStateRepository;
use crate::sync::ConnectionLocks;

pub struct StateSweeper {
    states: OAuthStateRepository,
    locks: Option<ConnectionLocks>,
    interval: Duration,
}

impl StateSweeper {
    pub fn new(db: Arc<DatabaseConnection>, interval: Duration) -> Self {
        Self {
            states: OAuthStateRepository::new(db),
            locks: None,
            interval,
        }
    }

    /// Also prune idle per-connection locks on every tick.
    pub fn with_locks(mut self, locks: ConnectionLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Run until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_seconds = self.interval.as_secs(), "Starting OAuth state sweeper");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("OAuth state sweeper shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    let started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "OAuth state sweep failed");
                    }
                    histogram!("oauth_state_sweep_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("OAuth state sweeper stopped");
    }

    /// One sweep. Returns the number of expired states removed.
    pub async fn tick(&self) -> Result<u64, sea_orm::DbErr> {
        let removed = self.states.cleanup_expired().await?;
        if removed > 0 {
            counter!("oauth_states_expired_total").increment(removed);
            info!(removed, "Removed expired OAuth states");
        } else {
            debug!("No expired OAuth states");
        }

        if let Some(locks) = &self.locks {
            locks.prune().await;
        }

        Ok(removed)
    }
}
