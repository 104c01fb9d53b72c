//! Round-robin upstream selection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::UpstreamSelector;
use crate::error::{GateError, Result};
use crate::models::{AvailableSnapshot, Upstream};

/// Cycles through the snapshot in order
///
/// The counter is shared by all requests and never reset when a new
/// snapshot is published; it is reduced modulo the current length.
pub struct RoundRobinSelector {
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamSelector for RoundRobinSelector {
    fn pick(&self, snapshot: &AvailableSnapshot) -> Result<Arc<Upstream>> {
        if snapshot.is_empty() {
            return Err(GateError::NoUpstreamAvailable);
        }

        let idx = self.index.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        snapshot.get(idx).cloned().ok_or(GateError::NoUpstreamAvailable)
    }

    fn strategy_name(&self) -> &'static str {
        "round-robin"
    }
}
