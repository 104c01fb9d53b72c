//! Health evaluation for upstreams
//!
//! Probes every pool entry concurrently, flips its `available` flag and
//! publishes a new available snapshot when the set of reachable addresses
//! actually changed. Cycles are serialized, and a cycle whose pool was
//! replaced while it ran does not publish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, Uri};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{GateError, Result};
use crate::models::{AvailableSnapshot, Scheme, Upstream};
use crate::proxy::pool::PoolManager;
use crate::proxy::transport::{ProxyBody, Target};
use crate::util::hash_addresses;

/// Health probe configuration
#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    /// Bound on the TCP dial to the upstream
    pub dial_timeout: Duration,
    /// Bound on the HTTP probe through the upstream
    pub probe_timeout: Duration,
    /// Fixed, externally reachable URL
    pub probe_url: Uri,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(3),
            probe_url: Uri::from_static("http://www.gstatic.com/generate_204"),
        }
    }
}

/// Checks whether one upstream can complete a round trip.
///
/// Returns the observed latency on success.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, upstream: &Upstream) -> Result<Duration>;
}

/// Probe that dials the upstream and then fetches the probe URL through it
pub struct NetworkProbe {
    config: HealthProbeConfig,
}

impl NetworkProbe {
    pub fn new(config: HealthProbeConfig) -> Self {
        Self { config }
    }

    fn probe_error(upstream: &Upstream, cause: impl ToString) -> GateError {
        GateError::Probe {
            address: upstream.address().to_string(),
            cause: cause.to_string(),
        }
    }

    async fn dial(&self, upstream: &Upstream) -> Result<()> {
        let authority = upstream
            .descriptor()
            .authority()
            .ok_or_else(|| Self::probe_error(upstream, "missing port"))?;

        match timeout(self.config.dial_timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Self::probe_error(upstream, e)),
            Err(_) => Err(Self::probe_error(upstream, "dial timed out")),
        }
    }

    async fn fetch(&self, upstream: &Upstream) -> Result<()> {
        let url = &self.config.probe_url;

        // TLS probe targets are checked by establishing a tunnel only.
        if url.scheme_str() == Some("https") {
            let target = Target::from_uri(url)?;
            let tunnel = timeout(self.config.probe_timeout, upstream.transport().connect(&target))
                .await
                .map_err(|_| Self::probe_error(upstream, "tunnel timed out"))?;
            return tunnel.map(|_| ()).map_err(|e| Self::probe_error(upstream, e));
        }

        let body: ProxyBody = Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync();
        let req = Request::get(url.clone())
            .header("User-Agent", "rotagate-health-check")
            .body(body)
            .map_err(|e| GateError::Internal(format!("Failed to build probe request: {}", e)))?;

        let response = timeout(self.config.probe_timeout, upstream.transport().round_trip(req))
            .await
            .map_err(|_| Self::probe_error(upstream, "probe timed out"))?
            .map_err(|e| Self::probe_error(upstream, e))?;

        if response.status().is_server_error() {
            return Err(Self::probe_error(
                upstream,
                format!("probe returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    #[instrument(skip(self, upstream), fields(upstream = %upstream.address()))]
    async fn probe(&self, upstream: &Upstream) -> Result<Duration> {
        if upstream.scheme() == Scheme::Direct {
            return Ok(Duration::ZERO);
        }

        let start = Instant::now();
        self.dial(upstream).await?;
        self.fetch(upstream).await?;
        Ok(start.elapsed())
    }
}

/// Severity of an availability shortfall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// At most a quarter of the pool is reachable
    Critical,
    /// At most half of the pool is reachable
    Degraded,
}

/// Classify an availability count.
///
/// Checked from most to least severe with integer arithmetic only, so a
/// count that satisfies both bounds reports as `Critical`.
pub fn classify(available: usize, total: usize) -> Option<Severity> {
    if available * 4 <= total {
        Some(Severity::Critical)
    } else if available * 2 <= total {
        Some(Severity::Degraded)
    } else {
        None
    }
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationReport {
    pub total: usize,
    pub available: usize,
    pub severity: Option<Severity>,
    /// Whether a new available snapshot was published
    pub published: bool,
}

/// Probes the whole pool and publishes the available subset
pub struct HealthEvaluator {
    probe: Arc<dyn HealthProbe>,
    /// Hard cap per upstream, covering dial and probe
    probe_budget: Duration,
    /// Hash of the last published alive set; held for a whole cycle
    alive_hash: Mutex<Option<String>>,
}

impl HealthEvaluator {
    pub fn new(probe: Arc<dyn HealthProbe>, probe_budget: Duration) -> Self {
        Self {
            probe,
            probe_budget,
            alive_hash: Mutex::new(None),
        }
    }

    /// Build an evaluator around the network probe
    pub fn with_network_probe(config: HealthProbeConfig) -> Self {
        let budget = config.dial_timeout + config.probe_timeout;
        Self::new(Arc::new(NetworkProbe::new(config)), budget)
    }

    /// Run one evaluation cycle over the current pool
    #[instrument(skip(self, manager))]
    pub async fn evaluate(&self, manager: &PoolManager) -> EvaluationReport {
        let mut alive_hash = self.alive_hash.lock().await;
        let pool = manager.pool();
        debug!("Checking health of {} upstreams", pool.len());

        let checks = pool.iter().cloned().map(|upstream| {
            let probe = self.probe.clone();
            let budget = self.probe_budget;
            tokio::spawn(async move {
                let latency = match timeout(budget, probe.probe(&upstream)).await {
                    Ok(Ok(latency)) => Some(latency),
                    Ok(Err(e)) => {
                        debug!("Upstream {} is not available: {}", upstream.address(), e);
                        None
                    }
                    Err(_) => {
                        debug!("Upstream {} probe exceeded {:?}", upstream.address(), budget);
                        None
                    }
                };
                upstream.record_probe(latency);
                debug!(
                    "upstream: {}, available: {}",
                    upstream.address(),
                    upstream.is_available()
                );
            })
        });

        for joined in join_all(checks).await {
            if let Err(e) = joined {
                error!("Health probe task failed: {}", e);
            }
        }

        let total = pool.len();
        let snapshot = AvailableSnapshot::from_pool(&pool);
        let available = snapshot.len();

        let severity = classify(available, total);
        match severity {
            Some(Severity::Critical) => error!(
                "Not enough available upstreams, available: [{}] total: [{}]",
                available, total
            ),
            Some(Severity::Degraded) => warn!(
                "Half of the upstreams are down, available: [{}] total: [{}]",
                available, total
            ),
            None => {}
        }

        let hash = hash_addresses(snapshot.addresses());
        let published = if !Arc::ptr_eq(&pool, &manager.pool()) {
            debug!("Pool replaced during evaluation, discarding result");
            false
        } else if alive_hash.as_deref() == Some(hash.as_str()) {
            debug!("Available upstreams unchanged");
            false
        } else {
            manager.publish_available(snapshot);
            *alive_hash = Some(hash);
            info!("Published {} available upstreams", available);
            true
        };

        EvaluationReport {
            total,
            available,
            severity,
            published,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::models::UpstreamDescriptor;
    use crate::proxy::builder::TransportBuilder;
    use crate::proxy::builder::UpstreamBuilder;
    use crate::proxy::pool::testing::FakeBuilder;
    use crate::proxy::resolver::SystemResolver;

    #[derive(Clone, Copy)]
    enum Behavior {
        Up(u64),
        Slow(u64),
        Down,
        Hang,
    }

    /// Probe driven by a per-address script; unknown addresses are up
    struct ScriptedProbe {
        script: Mutex<HashMap<String, Behavior>>,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
            }
        }

        fn set(&self, address: &str, behavior: Behavior) {
            self.script.lock().insert(address.to_string(), behavior);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, upstream: &Upstream) -> Result<Duration> {
            let behavior = self
                .script
                .lock()
                .get(upstream.address())
                .copied()
                .unwrap_or(Behavior::Up(1));
            match behavior {
                Behavior::Up(ms) => Ok(Duration::from_millis(ms)),
                Behavior::Slow(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(Duration::from_millis(ms))
                }
                Behavior::Down => Err(GateError::Probe {
                    address: upstream.address().to_string(),
                    cause: "refused".to_string(),
                }),
                Behavior::Hang => futures::future::pending().await,
            }
        }
    }

    fn addresses(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("http://10.0.2.{}:8080", i)).collect()
    }

    async fn pool_of(addrs: &[String]) -> PoolManager {
        let manager = PoolManager::new(Arc::new(FakeBuilder::default()));
        manager.refresh(addrs).await.unwrap();
        manager
    }

    #[test]
    fn test_threshold_ordering() {
        assert_eq!(classify(2, 10), Some(Severity::Critical));
        assert_eq!(classify(4, 10), Some(Severity::Degraded));
        assert_eq!(classify(6, 10), None);
    }

    #[test]
    fn test_threshold_boundaries_are_integer_exact() {
        // 25% exactly is critical, 50% exactly is degraded.
        assert_eq!(classify(1, 4), Some(Severity::Critical));
        assert_eq!(classify(2, 4), Some(Severity::Degraded));
        assert_eq!(classify(3, 10), Some(Severity::Degraded));
        assert_eq!(classify(5, 10), Some(Severity::Degraded));
        assert_eq!(classify(3, 4), None);
        assert_eq!(classify(0, 0), Some(Severity::Critical));
    }

    #[tokio::test]
    async fn test_hanging_probe_is_isolated() {
        let addrs = addresses(10);
        let manager = pool_of(&addrs).await;

        let probe = Arc::new(ScriptedProbe::new());
        probe.set(&addrs[3], Behavior::Hang);
        let evaluator = HealthEvaluator::new(probe, Duration::from_millis(300));

        let start = Instant::now();
        let report = evaluator.evaluate(&manager).await;
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(report.total, 10);
        assert_eq!(report.available, 9);
        assert_eq!(report.severity, None);
        assert!(report.published);

        let pool = manager.pool();
        assert!(!pool.get(3).unwrap().is_available());
        assert_eq!(manager.available().len(), 9);
        assert!(!manager.available().addresses().contains(&addrs[3].as_str()));
    }

    #[tokio::test]
    async fn test_unchanged_alive_set_skips_publish() {
        let addrs = addresses(3);
        let manager = pool_of(&addrs).await;
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(&addrs[1], Behavior::Down);
        let evaluator = HealthEvaluator::new(probe.clone(), Duration::from_millis(300));

        assert!(evaluator.evaluate(&manager).await.published);
        let first = manager.available();

        // Latency changes alone do not republish.
        probe.set(&addrs[0], Behavior::Up(50));
        let report = evaluator.evaluate(&manager).await;
        assert!(!report.published);
        assert!(Arc::ptr_eq(&first, &manager.available()));
        assert_eq!(
            manager.pool().get(0).unwrap().latency(),
            Some(Duration::from_millis(50))
        );

        probe.set(&addrs[1], Behavior::Up(5));
        let report = evaluator.evaluate(&manager).await;
        assert!(report.published);
        assert_eq!(manager.available().len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_on_replaced_pool_does_not_publish() {
        let addrs = addresses(2);
        let manager = Arc::new(pool_of(&addrs).await);
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(&addrs[1], Behavior::Slow(300));
        let evaluator = Arc::new(HealthEvaluator::new(probe, Duration::from_secs(2)));

        let slow = {
            let manager = manager.clone();
            let evaluator = evaluator.clone();
            tokio::spawn(async move { evaluator.evaluate(&manager).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second address leaves the source while the slow cycle runs.
        let outcome = manager.refresh(&addrs[..1]).await.unwrap();
        assert!(outcome.is_updated());
        let report = evaluator.evaluate(&manager).await;
        assert!(report.published);

        let stale = slow.await.unwrap();
        assert!(!stale.published);
        assert_eq!(manager.pool().len(), 1);
        assert_eq!(manager.available().addresses(), vec![addrs[0].as_str()]);
    }

    #[tokio::test]
    async fn test_failures_never_remove_from_pool() {
        let addrs = addresses(4);
        let manager = pool_of(&addrs).await;
        let probe = Arc::new(ScriptedProbe::new());
        for addr in &addrs {
            probe.set(addr, Behavior::Down);
        }
        let evaluator = HealthEvaluator::new(probe, Duration::from_millis(300));

        let report = evaluator.evaluate(&manager).await;
        assert_eq!(report.available, 0);
        assert_eq!(report.severity, Some(Severity::Critical));
        assert_eq!(manager.pool().len(), 4);
        assert!(manager.available().is_empty());
    }

    #[tokio::test]
    async fn test_network_probe_direct_is_trivially_available() {
        let builder = TransportBuilder::new(Duration::from_secs(1), Arc::new(SystemResolver));
        let upstream = builder
            .build(UpstreamDescriptor::parse("direct://0.0.0.0").unwrap())
            .await
            .unwrap();

        let probe = NetworkProbe::new(HealthProbeConfig::default());
        assert_eq!(probe.probe(&upstream).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_network_probe_through_http_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is the dial check, second carries the probe.
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        if n > 0 {
                            let _ = stream
                                .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                                .await;
                        }
                    }
                });
            }
        });

        let builder = TransportBuilder::new(Duration::from_secs(1), Arc::new(SystemResolver));
        let upstream = builder
            .build(UpstreamDescriptor::parse(&format!("http://{}", proxy_addr)).unwrap())
            .await
            .unwrap();

        let probe = NetworkProbe::new(HealthProbeConfig {
            dial_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            probe_url: Uri::from_static("http://probe.invalid/generate_204"),
        });
        assert!(probe.probe(&upstream).await.is_ok());
    }

    #[tokio::test]
    async fn test_network_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let descriptor = UpstreamDescriptor::parse(&format!("socks5://{}", addr)).unwrap();
        let upstream = TransportBuilder::new(Duration::from_secs(1), Arc::new(SystemResolver))
            .build(descriptor)
            .await
            .unwrap();
        drop(listener);

        let probe = NetworkProbe::new(HealthProbeConfig::default());
        let err = probe.probe(&upstream).await.unwrap_err();
        assert!(matches!(err, GateError::Probe { .. }));
    }
}
