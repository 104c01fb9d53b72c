//! Upstream pool with differential refresh
//!
//! Reloading the descriptor list keeps every already-built upstream whose
//! address is still listed, builds only the new ones concurrently, and
//! publishes the result with a single atomic swap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::error::{GateError, Result};
use crate::models::{parse_lines, AvailableSnapshot, Upstream, UpstreamDescriptor, UpstreamPool};
use crate::proxy::builder::UpstreamBuilder;
use crate::util::hash_addresses;

/// Result of one refresh call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Source content identical to the previous refresh; nothing touched
    Unchanged,
    /// A new pool generation was published
    Updated {
        reused: usize,
        built: usize,
        failed: usize,
    },
}

impl RefreshOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, RefreshOutcome::Updated { .. })
    }
}

enum Slot {
    Reused(Arc<Upstream>),
    Build(usize),
}

/// Owns the published pool and available snapshot.
///
/// Readers load either with a lock-free `ArcSwap` read. Refresh is expected
/// to be driven by a single task at a time.
pub struct PoolManager {
    builder: Arc<dyn UpstreamBuilder>,
    pool: ArcSwap<UpstreamPool>,
    available: ArcSwap<AvailableSnapshot>,
    hosts_hash: Mutex<Option<String>>,
}

impl PoolManager {
    pub fn new(builder: Arc<dyn UpstreamBuilder>) -> Self {
        Self {
            builder,
            pool: ArcSwap::from_pointee(UpstreamPool::new()),
            available: ArcSwap::from_pointee(AvailableSnapshot::empty()),
            hosts_hash: Mutex::new(None),
        }
    }

    /// Current pool generation
    pub fn pool(&self) -> Arc<UpstreamPool> {
        self.pool.load_full()
    }

    /// Currently published available snapshot
    pub fn available(&self) -> Arc<AvailableSnapshot> {
        self.available.load_full()
    }

    /// Replace the available snapshot in one swap
    pub fn publish_available(&self, snapshot: AvailableSnapshot) {
        self.available.store(Arc::new(snapshot));
    }

    /// Reload the pool from the raw lines of the descriptor source
    #[instrument(skip(self, lines))]
    pub async fn refresh<I, S>(&self, lines: I) -> Result<RefreshOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let descriptors = dedupe(parse_lines(lines));
        let hash = hash_addresses(descriptors.iter().map(|d| d.address.as_str()));

        if self.hosts_hash.lock().as_deref() == Some(hash.as_str()) {
            debug!("Upstream list unchanged, skipping refresh");
            return Ok(RefreshOutcome::Unchanged);
        }

        let previous = self.pool.load_full();
        let known: HashMap<&str, &Arc<Upstream>> =
            previous.iter().map(|u| (u.address(), u)).collect();

        let mut slots = Vec::with_capacity(descriptors.len());
        let mut to_build = Vec::new();
        for descriptor in descriptors {
            match known.get(descriptor.address.as_str()) {
                Some(existing) => slots.push(Slot::Reused(Arc::clone(*existing))),
                None => {
                    slots.push(Slot::Build(to_build.len()));
                    to_build.push(descriptor);
                }
            }
        }

        let handles = to_build.into_iter().map(|descriptor| {
            let builder = self.builder.clone();
            tokio::spawn(async move {
                let address = descriptor.address.clone();
                (address, builder.build(descriptor).await)
            })
        });

        let mut built: Vec<Option<Upstream>> = Vec::new();
        for joined in join_all(handles).await {
            let upstream = match joined {
                Ok((_, Ok(upstream))) => Some(upstream),
                Ok((address, Err(e))) => {
                    error!("Init upstream [{}] error: {}", address, e);
                    None
                }
                Err(e) => {
                    error!("Upstream build task failed: {}", e);
                    None
                }
            };
            built.push(upstream);
        }

        let mut pool = UpstreamPool::new();
        let (mut reused, mut built_count, mut failed) = (0, 0, 0);
        for slot in slots {
            match slot {
                Slot::Reused(upstream) => {
                    reused += 1;
                    pool.add(upstream);
                }
                Slot::Build(idx) => match built.get_mut(idx).and_then(Option::take) {
                    Some(upstream) => {
                        built_count += 1;
                        pool.add(Arc::new(upstream));
                    }
                    None => failed += 1,
                },
            }
        }

        info!(
            total = pool.len(),
            reused, built = built_count, failed, "Upstream pool refreshed"
        );

        self.pool.store(Arc::new(pool));
        *self.hosts_hash.lock() = Some(hash);

        Ok(RefreshOutcome::Updated {
            reused,
            built: built_count,
            failed,
        })
    }

    /// Refresh from a fetch result, keeping the current pool when the fetch failed
    pub async fn refresh_from(&self, fetched: Result<Vec<String>>) -> Result<RefreshOutcome> {
        match fetched {
            Ok(lines) => self.refresh(lines).await,
            Err(e) => Err(match e {
                GateError::SourceUnreachable(_) => e,
                other => GateError::SourceUnreachable(other.to_string()),
            }),
        }
    }
}

/// Drop repeated addresses, keeping the first occurrence
fn dedupe(descriptors: Vec<UpstreamDescriptor>) -> Vec<UpstreamDescriptor> {
    let mut seen = HashSet::new();
    descriptors
        .into_iter()
        .filter(|d| {
            let fresh = seen.insert(d.address.clone());
            if !fresh {
                debug!("Duplicate upstream {} ignored", d.address);
            }
            fresh
        })
        .collect()
}
