//! Upstream scheduling policies
//!
//! Every policy picks from the available snapshot handed to it and never
//! touches the pool itself.

mod latency;
mod random;
mod round_robin;

pub use latency::LatencySelector;
pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::Arc;

use crate::error::{GateError, Result};
use crate::models::{AvailableSnapshot, Upstream};

/// Scheduling policy names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerPolicy {
    #[default]
    RoundRobin,
    Random,
    /// Lowest recorded latency
    Ping,
}

impl SchedulerPolicy {
    /// Parse a policy name; unknown names are a configuration error
    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "ping" => Ok(Self::Ping),
            other => Err(GateError::ConfigValidation(format!(
                "Unknown scheduler '{}', expected one of: round-robin, random, ping",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::Ping => "ping",
        }
    }
}

/// Picks one upstream from an available snapshot
pub trait UpstreamSelector: Send + Sync {
    /// Returns `NoUpstreamAvailable` when the snapshot is empty
    fn pick(&self, snapshot: &AvailableSnapshot) -> Result<Arc<Upstream>>;

    fn strategy_name(&self) -> &'static str;
}

/// Create a selector for the configured policy
pub fn create_selector(policy: SchedulerPolicy) -> Box<dyn UpstreamSelector> {
    match policy {
        SchedulerPolicy::RoundRobin => Box::new(RoundRobinSelector::new()),
        SchedulerPolicy::Random => Box::new(RandomSelector::new()),
        SchedulerPolicy::Ping => Box::new(LatencySelector::new()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_policy_from_str() {
        assert_eq!(
            SchedulerPolicy::from_str("round-robin").unwrap(),
            SchedulerPolicy::RoundRobin
        );
        assert_eq!(
            SchedulerPolicy::from_str("Random").unwrap(),
            SchedulerPolicy::Random
        );
        assert_eq!(
            SchedulerPolicy::from_str("ping").unwrap(),
            SchedulerPolicy::Ping
        );
        assert!(matches!(
            SchedulerPolicy::from_str("least-conn"),
            Err(GateError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_create_selector_strategy_name() {
        for policy in [
            SchedulerPolicy::RoundRobin,
            SchedulerPolicy::Random,
            SchedulerPolicy::Ping,
        ] {
            assert_eq!(create_selector(policy).strategy_name(), policy.as_str());
        }
    }

    #[test]
    fn test_every_policy_rejects_empty_snapshot() {
        let empty = AvailableSnapshot::empty();
        for policy in [
            SchedulerPolicy::RoundRobin,
            SchedulerPolicy::Random,
            SchedulerPolicy::Ping,
        ] {
            let result = create_selector(policy).pick(&empty);
            assert!(matches!(result, Err(GateError::NoUpstreamAvailable)));
        }
    }
}
