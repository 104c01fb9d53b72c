//! Random upstream selection

use std::sync::Arc;

use rand::Rng;

use super::UpstreamSelector;
use crate::error::{GateError, Result};
use crate::models::{AvailableSnapshot, Upstream};

/// Picks uniformly at random from the snapshot
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl UpstreamSelector for RandomSelector {
    fn pick(&self, snapshot: &AvailableSnapshot) -> Result<Arc<Upstream>> {
        if snapshot.is_empty() {
            return Err(GateError::NoUpstreamAvailable);
        }

        let idx = rand::thread_rng().gen_range(0..snapshot.len());
        snapshot.get(idx).cloned().ok_or(GateError::NoUpstreamAvailable)
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
