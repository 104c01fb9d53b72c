//! Rotagate - forwarding gateway over a pool of upstream proxies
//!
//! Client HTTP traffic is spread across HTTP, SOCKS5 and direct-dial
//! upstreams under a pluggable scheduling policy.
//!
//! ## Features
//!
//! - Upstream list from a file or URL with differential refresh
//! - Concurrent health evaluation with change-detected publication
//! - Round-robin, random and latency-based scheduling
//! - CONNECT tunnels and absolute-form HTTP forwarding
//! - No-proxy CIDR bypass and User-Agent rewriting

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod util;

pub use config::Config;
pub use error::{GateError, Result};
