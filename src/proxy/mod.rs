//! Gateway core
//!
//! This module provides:
//! - Upstream transports (HTTP proxy, SOCKS5, direct)
//! - Upstream construction and the differentially refreshed pool
//! - Concurrent health evaluation
//! - Scheduling policies
//! - The request handler, CONNECT tunnels and the listener

pub mod builder;
pub mod handler;
pub mod health;
pub mod pool;
pub mod resolver;
pub mod rotation;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use builder::{TransportBuilder, UpstreamBuilder};
pub use handler::{GatewayHandler, GatewayHandlerConfig, UserAgentPolicy};
pub use health::{HealthEvaluator, HealthProbe, NetworkProbe, Severity};
pub use pool::{PoolManager, RefreshOutcome};
pub use resolver::{Resolver, SystemResolver};
pub use rotation::{create_selector, SchedulerPolicy, UpstreamSelector};
pub use server::GatewayServer;
pub use transport::{Target, UpstreamTransport};
pub use tunnel::TunnelHandler;
