//! Periodic descriptor refresh service
//!
//! Each tick fetches the source, applies a differential refresh and, when a
//! new pool generation was published, evaluates it right away so the
//! available snapshot follows the new pool without waiting for the health
//! monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::proxy::health::HealthEvaluator;
use crate::proxy::pool::{PoolManager, RefreshOutcome};
use crate::services::source::DescriptorSource;

/// Refresh service configuration
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub refresh_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Refresh service
pub struct RefreshService {
    source: DescriptorSource,
    pool: Arc<PoolManager>,
    evaluator: Arc<HealthEvaluator>,
    config: RefreshConfig,
}

impl RefreshService {
    pub fn new(
        source: DescriptorSource,
        pool: Arc<PoolManager>,
        evaluator: Arc<HealthEvaluator>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            source,
            pool,
            evaluator,
            config,
        }
    }

    /// Run the refresh service until shutdown.
    ///
    /// The first cycle is expected to have been run by the caller.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting refresh service (source: {}, interval: {}s)",
            self.source.kind(),
            self.config.refresh_interval.as_secs()
        );

        let mut ticker = interval(self.config.refresh_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Upstream refresh failed, keeping current pool: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One fetch, refresh and (if anything changed) evaluate cycle
    pub async fn run_once(&self) -> Result<RefreshOutcome> {
        let outcome = self.pool.refresh_from(self.source.fetch().await).await?;

        match outcome {
            RefreshOutcome::Unchanged => debug!("Upstream source unchanged"),
            RefreshOutcome::Updated { .. } => {
                let report = self.evaluator.evaluate(&self.pool).await;
                debug!(
                    "Evaluated new pool: {}/{} available",
                    report.available, report.total
                );
            }
        }

        Ok(outcome)
    }
}
