//! Name resolution for final destinations

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::error::{GateError, Result};

/// Resolves a destination hostname to one IP address
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        lookup_host((host, 0))
            .await
            .map_err(|e| GateError::ConnectFailed(format!("Resolve {} failed: {}", host, e)))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| GateError::ConnectFailed(format!("No address found for {}", host)))
    }
}
