//! Upstream entries, the pool and the available snapshot

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::descriptor::{Scheme, UpstreamDescriptor};
use crate::proxy::transport::UpstreamTransport;

const LATENCY_UNMEASURED: u64 = u64::MAX;

/// One outbound proxy (or direct dial) the gateway can forward through.
///
/// Identity is the descriptor address string. The `available` flag and
/// latency are only written by the health evaluator; everything else is
/// fixed for the lifetime of the object.
pub struct Upstream {
    descriptor: UpstreamDescriptor,
    available: AtomicBool,
    latency_micros: AtomicU64,
    transport: Box<dyn UpstreamTransport>,
}

impl Upstream {
    pub fn new(descriptor: UpstreamDescriptor, transport: Box<dyn UpstreamTransport>) -> Self {
        Self {
            descriptor,
            available: AtomicBool::new(false),
            latency_micros: AtomicU64::new(LATENCY_UNMEASURED),
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.descriptor.address
    }

    pub fn scheme(&self) -> Scheme {
        self.descriptor.scheme
    }

    pub fn descriptor(&self) -> &UpstreamDescriptor {
        &self.descriptor
    }

    pub fn transport(&self) -> &dyn UpstreamTransport {
        self.transport.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Latency observed by the last successful probe
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_micros.load(Ordering::Acquire) {
            LATENCY_UNMEASURED => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Record the outcome of a health probe
    pub(crate) fn record_probe(&self, latency: Option<Duration>) {
        match latency {
            Some(latency) => {
                let micros = u64::try_from(latency.as_micros()).unwrap_or(LATENCY_UNMEASURED - 1);
                self.latency_micros.store(micros, Ordering::Release);
                self.available.store(true, Ordering::Release);
            }
            None => {
                self.available.store(false, Ordering::Release);
            }
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("address", &self.address())
            .field("available", &self.is_available())
            .field("latency", &self.latency())
            .finish()
    }
}

/// Ordered collection of upstreams from the most recent refresh
#[derive(Debug, Default, Clone)]
pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, upstream: Arc<Upstream>) {
        self.upstreams.push(upstream);
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Upstream>> {
        self.upstreams.get(index)
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter()
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.upstreams.iter().map(|u| u.address()).collect()
    }
}

impl FromIterator<Arc<Upstream>> for UpstreamPool {
    fn from_iter<T: IntoIterator<Item = Arc<Upstream>>>(iter: T) -> Self {
        Self {
            upstreams: iter.into_iter().collect(),
        }
    }
}

/// Immutable point-in-time subset of the pool believed reachable
#[derive(Debug, Default, Clone)]
pub struct AvailableSnapshot {
    upstreams: Vec<Arc<Upstream>>,
}

impl AvailableSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Take the entries of `pool` currently flagged available, in pool order
    pub fn from_pool(pool: &UpstreamPool) -> Self {
        Self {
            upstreams: pool
                .iter()
                .filter(|u| u.is_available())
                .cloned()
                .collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Upstream>> {
        self.upstreams.get(index)
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter()
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.upstreams.iter().map(|u| u.address()).collect()
    }
}

impl FromIterator<Arc<Upstream>> for AvailableSnapshot {
    fn from_iter<T: IntoIterator<Item = Arc<Upstream>>>(iter: T) -> Self {
        Self {
            upstreams: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::testing::NoopTransport;

    fn upstream(addr: &str) -> Arc<Upstream> {
        let descriptor = UpstreamDescriptor::parse(addr).unwrap();
        Arc::new(Upstream::new(descriptor, Box::new(NoopTransport)))
    }

    #[test]
    fn test_new_upstream_is_unavailable_and_unmeasured() {
        let u = upstream("http://127.0.0.1:8080");
        assert!(!u.is_available());
        assert_eq!(u.latency(), None);
    }

    #[test]
    fn test_record_probe_failure_keeps_last_latency() {
        let u = upstream("http://127.0.0.1:8080");
        u.record_probe(Some(Duration::from_millis(12)));
        assert!(u.is_available());
        assert_eq!(u.latency(), Some(Duration::from_millis(12)));

        u.record_probe(None);
        assert!(!u.is_available());
        assert_eq!(u.latency(), Some(Duration::from_millis(12)));
    }

    #[test]
    fn test_snapshot_keeps_pool_order() {
        let pool: UpstreamPool = ["http://a:1", "http://b:2", "http://c:3"]
            .into_iter()
            .map(upstream)
            .collect();
        pool.get(0).unwrap().record_probe(Some(Duration::from_millis(1)));
        pool.get(2).unwrap().record_probe(Some(Duration::from_millis(1)));

        let snapshot = AvailableSnapshot::from_pool(&pool);
        assert_eq!(snapshot.addresses(), vec!["http://a:1", "http://c:3"]);
        assert!(Arc::ptr_eq(snapshot.get(1).unwrap(), pool.get(2).unwrap()));
    }
}
