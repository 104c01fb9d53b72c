//! Periodic health evaluation service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use crate::proxy::health::HealthEvaluator;
use crate::proxy::pool::PoolManager;

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
        }
    }
}

/// Re-evaluates the whole pool on a fixed interval
pub struct HealthMonitor {
    pool: Arc<PoolManager>,
    evaluator: Arc<HealthEvaluator>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<PoolManager>,
        evaluator: Arc<HealthEvaluator>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            pool,
            evaluator,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health monitor (interval: {}s)",
            self.config.check_interval.as_secs()
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.evaluator.evaluate(&self.pool).await;
                    debug!(
                        "Health check complete: {}/{} available",
                        report.available, report.total
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::error::{GateError, Result};
    use crate::models::Upstream;
    use crate::proxy::health::HealthProbe;
    use crate::proxy::pool::testing::FakeBuilder;
    use crate::services::ShutdownHandle;

    /// Probe whose answer can be flipped from the test
    struct Switch(AtomicBool);

    #[async_trait]
    impl HealthProbe for Switch {
        async fn probe(&self, upstream: &Upstream) -> Result<Duration> {
            if self.0.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(1))
            } else {
                Err(GateError::Probe {
                    address: upstream.address().to_string(),
                    cause: "down".to_string(),
                })
            }
        }
    }

    #[test]
    fn test_config_default() {
        assert_eq!(
            HealthMonitorConfig::default().check_interval,
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_monitor_tracks_probe_results_until_shutdown() {
        let pool = Arc::new(PoolManager::new(Arc::new(FakeBuilder::default())));
        pool.refresh(["http://10.0.0.1:8080", "http://10.0.0.2:8080"])
            .await
            .unwrap();

        let probe = Arc::new(Switch(AtomicBool::new(true)));
        let evaluator = Arc::new(HealthEvaluator::new(probe.clone(), Duration::from_secs(1)));
        let monitor = HealthMonitor::new(
            pool.clone(),
            evaluator,
            HealthMonitorConfig {
                check_interval: Duration::from_millis(20),
            },
        );

        let (handle, rx) = ShutdownHandle::new();
        let task = tokio::spawn(async move { monitor.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.available().len(), 2);

        probe.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.available().is_empty());
        assert_eq!(pool.pool().len(), 2);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("health monitor did not stop")
            .unwrap();
    }
}
