//! Upstream construction from parsed descriptors

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{GateError, Result};
use crate::models::{Scheme, Upstream, UpstreamDescriptor};
use crate::proxy::resolver::Resolver;
use crate::proxy::transport::{
    DirectTransport, HttpProxyTransport, Socks5Transport, UpstreamTransport,
};

/// Turns a descriptor into a ready upstream.
///
/// Implementations must not share mutable state between builds; the pool
/// runs many of them concurrently.
#[async_trait]
pub trait UpstreamBuilder: Send + Sync {
    async fn build(&self, descriptor: UpstreamDescriptor) -> Result<Upstream>;
}

/// Builds network transports, probing the upstream with a bounded dial first
pub struct TransportBuilder {
    dial_timeout: Duration,
    resolver: Arc<dyn Resolver>,
}

impl TransportBuilder {
    pub fn new(dial_timeout: Duration, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            dial_timeout,
            resolver,
        }
    }

    async fn dial_probe(&self, descriptor: &UpstreamDescriptor) -> Result<()> {
        let authority = descriptor.authority().ok_or_else(|| GateError::Build {
            address: descriptor.address.clone(),
            cause: "missing port".to_string(),
        })?;

        match timeout(self.dial_timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(GateError::Build {
                address: descriptor.address.clone(),
                cause: e.to_string(),
            }),
            Err(_) => Err(GateError::Build {
                address: descriptor.address.clone(),
                cause: format!("dial timed out after {:?}", self.dial_timeout),
            }),
        }
    }

    fn transport_for(&self, descriptor: &UpstreamDescriptor) -> Result<Box<dyn UpstreamTransport>> {
        let authority = || {
            descriptor.authority().ok_or_else(|| GateError::Build {
                address: descriptor.address.clone(),
                cause: "missing port".to_string(),
            })
        };

        let transport: Box<dyn UpstreamTransport> = match descriptor.scheme {
            Scheme::Http | Scheme::Https => Box::new(HttpProxyTransport::new(
                authority()?,
                descriptor.username.as_deref(),
                descriptor.password.as_deref(),
            )?),
            Scheme::Socks5 => Box::new(Socks5Transport::new(
                authority()?,
                descriptor.username.as_deref(),
                descriptor.password.as_deref(),
            )),
            Scheme::Direct => Box::new(DirectTransport::new(self.resolver.clone())),
        };

        Ok(transport)
    }
}

#[async_trait]
impl UpstreamBuilder for TransportBuilder {
    #[instrument(skip(self, descriptor), fields(upstream = %descriptor.address))]
    async fn build(&self, descriptor: UpstreamDescriptor) -> Result<Upstream> {
        if descriptor.scheme != Scheme::Direct {
            self.dial_probe(&descriptor).await?;
        }

        let transport = self.transport_for(&descriptor)?;
        debug!("Built {} upstream", transport.kind());
        Ok(Upstream::new(descriptor, transport))
    }
}
