//! Gateway listener built on hyper
//!
//! Accepts client connections and serves standard forward-proxy semantics
//! (absolute-form requests and CONNECT) through the gateway handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::proxy::handler::GatewayHandler;

/// Gateway server
pub struct GatewayServer {
    listener: TcpListener,
    handler: Arc<GatewayHandler>,
}

impl GatewayServer {
    /// Bind the listening socket
    pub async fn bind(addr: &str, handler: Arc<GatewayHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Gateway listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!("Connection from {} ended: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(stream: TcpStream, handler: Arc<GatewayHandler>) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}
