//! Latency-based ("ping") upstream selection

use std::sync::Arc;
use std::time::Duration;

use super::UpstreamSelector;
use crate::error::{GateError, Result};
use crate::models::{AvailableSnapshot, Upstream};

/// Picks the upstream with the lowest recorded latency.
///
/// Ties go to the lowest snapshot index; unmeasured upstreams rank last.
#[derive(Debug, Default)]
pub struct LatencySelector;

impl LatencySelector {
    pub fn new() -> Self {
        Self
    }
}

impl UpstreamSelector for LatencySelector {
    fn pick(&self, snapshot: &AvailableSnapshot) -> Result<Arc<Upstream>> {
        // min_by_key keeps the first of equal minima.
        snapshot
            .iter()
            .min_by_key(|u| u.latency().unwrap_or(Duration::MAX))
            .cloned()
            .ok_or(GateError::NoUpstreamAvailable)
    }

    fn strategy_name(&self) -> &'static str {
        "ping"
    }
}
