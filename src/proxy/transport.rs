//! Upstream transport layer for HTTP-proxy, SOCKS5 and direct dialing
//!
//! Every upstream owns exactly one transport. A transport can open a raw
//! byte stream to a target (used for CONNECT tunnels) and perform a single
//! HTTP round trip (used for plain HTTP forwarding and health probes).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{GateError, Result};
use crate::models::format_host_port;
use crate::proxy::resolver::Resolver;

/// Boxed error carried by streamed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the gateway in both directions
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Final destination of a forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Address already resolved by the handler, if any
    pub ip: Option<IpAddr>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Parse host and port from an absolute-form URI
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let host = uri
            .host()
            .ok_or_else(|| GateError::InvalidRequest("Missing host in URI".to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok(Self::new(host, port))
    }

    /// Parse host and port from an authority (CONNECT requests)
    pub fn from_authority(authority: &str) -> Result<Self> {
        let uri: Uri = authority
            .parse()
            .map_err(|_| GateError::InvalidRequest(format!("Invalid authority: {}", authority)))?;
        let host = uri
            .host()
            .ok_or_else(|| GateError::InvalidRequest(format!("Invalid authority: {}", authority)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        // Default to 443 for CONNECT (typically HTTPS)
        Ok(Self::new(host, uri.port_u16().unwrap_or(443)))
    }

    pub fn authority(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

/// Capability to move traffic through one upstream
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Open a byte stream to `target` through this upstream
    async fn connect(&self, target: &Target) -> Result<TcpStream>;

    /// Perform one HTTP round trip through this upstream.
    ///
    /// The request URI must be in absolute form.
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>>;

    /// Short name of the transport kind
    fn kind(&self) -> &'static str;
}

/// Forwards through an HTTP proxy (CONNECT for tunnels, absolute-form for plain HTTP)
pub struct HttpProxyTransport {
    proxy_addr: String,
    authorization: Option<HeaderValue>,
}

impl HttpProxyTransport {
    pub fn new(proxy_addr: String, username: Option<&str>, password: Option<&str>) -> Result<Self> {
        let authorization = match username {
            Some(username) => {
                let credentials = format!("{}:{}", username, password.unwrap_or(""));
                let value = format!("Basic {}", BASE64.encode(credentials.as_bytes()));
                Some(HeaderValue::from_str(&value).map_err(|e| {
                    GateError::InvalidRequest(format!("Invalid proxy credentials: {}", e))
                })?)
            }
            None => None,
        };

        Ok(Self {
            proxy_addr,
            authorization,
        })
    }

    fn build_connect_request(&self, target: &Target) -> String {
        let authority = target.authority();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

        if let Some(auth) = self.authorization.as_ref().and_then(|v| v.to_str().ok()) {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }

        request.push_str("\r\n");
        request
    }

    async fn establish_tunnel(&self, target: &Target) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        stream
            .write_all(self.build_connect_request(target).as_bytes())
            .await?;

        let head = read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or("Unknown error");
        if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
            anyhow::bail!("CONNECT failed: {}", status_line);
        }

        Ok(stream)
    }
}

#[async_trait]
impl UpstreamTransport for HttpProxyTransport {
    #[instrument(skip(self), fields(proxy = %self.proxy_addr))]
    async fn connect(&self, target: &Target) -> Result<TcpStream> {
        debug!("Connecting to HTTP proxy at {}", self.proxy_addr);
        let stream = self.establish_tunnel(target).await.map_err(|e| {
            GateError::ConnectFailed(format!(
                "HTTP proxy {} -> {}: {}",
                self.proxy_addr,
                target.authority(),
                e
            ))
        })?;
        debug!("HTTP CONNECT tunnel established");
        Ok(stream)
    }

    async fn round_trip(&self, mut req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        ensure_host_header(&mut req)?;
        if let Some(auth) = &self.authorization {
            req.headers_mut().insert(PROXY_AUTHORIZATION, auth.clone());
        }

        let stream = TcpStream::connect(&self.proxy_addr).await.map_err(|e| {
            GateError::ConnectFailed(format!("TCP connect to {} failed: {}", self.proxy_addr, e))
        })?;

        // The proxy expects the absolute-form request target.
        send_request(stream, req).await
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Forwards through a SOCKS5 proxy
pub struct Socks5Transport {
    proxy_addr: String,
    credentials: Option<(String, String)>,
}

impl Socks5Transport {
    pub fn new(proxy_addr: String, username: Option<&str>, password: Option<&str>) -> Self {
        let credentials = username.map(|u| (u.to_string(), password.unwrap_or("").to_string()));
        Self {
            proxy_addr,
            credentials,
        }
    }

    async fn handshake(&self, target: &Target) -> anyhow::Result<TcpStream> {
        let socket = TcpStream::connect(&self.proxy_addr).await?;
        let destination = (target.host.as_str(), target.port);

        let stream = match &self.credentials {
            Some((username, password)) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    destination,
                    username,
                    password,
                )
                .await?
            }
            None => Socks5Stream::connect_with_socket(socket, destination).await?,
        };

        Ok(stream.into_inner())
    }
}

#[async_trait]
impl UpstreamTransport for Socks5Transport {
    #[instrument(skip(self), fields(proxy = %self.proxy_addr))]
    async fn connect(&self, target: &Target) -> Result<TcpStream> {
        debug!("Connecting to SOCKS5 proxy at {}", self.proxy_addr);
        let stream = self.handshake(target).await.map_err(|e| {
            GateError::ConnectFailed(format!(
                "SOCKS5 proxy {} -> {}: {}",
                self.proxy_addr,
                target.authority(),
                e
            ))
        })?;
        debug!("SOCKS5 connection established");
        Ok(stream)
    }

    async fn round_trip(&self, mut req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let target = Target::from_uri(req.uri())?;
        ensure_host_header(&mut req)?;
        let stream = self.connect(&target).await?;
        into_origin_form(&mut req)?;
        send_request(stream, req).await
    }

    fn kind(&self) -> &'static str {
        "socks5"
    }
}

/// Dials the destination itself, no intermediary
pub struct DirectTransport {
    resolver: Arc<dyn Resolver>,
}

impl DirectTransport {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl UpstreamTransport for DirectTransport {
    async fn connect(&self, target: &Target) -> Result<TcpStream> {
        let ip = match target.ip {
            Some(ip) => ip,
            None => self.resolver.resolve(&target.host).await?,
        };
        let addr = SocketAddr::new(ip, target.port);
        debug!("Dialing {} directly at {}", target.host, addr);

        TcpStream::connect(addr)
            .await
            .map_err(|e| GateError::ConnectFailed(format!("Direct connect to {} failed: {}", addr, e)))
    }

    async fn round_trip(&self, mut req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let target = Target::from_uri(req.uri())?;
        ensure_host_header(&mut req)?;
        let stream = self.connect(&target).await?;
        into_origin_form(&mut req)?;
        send_request(stream, req).await
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}

/// Send a request over an already-established stream with HTTP/1.1
async fn send_request(stream: TcpStream, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| GateError::ConnectFailed(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| GateError::ConnectFailed(format!("Request failed: {}", e)))?;

    Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()))
}

fn ensure_host_header(req: &mut Request<ProxyBody>) -> Result<()> {
    if req.headers().contains_key(HOST) {
        return Ok(());
    }

    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| GateError::InvalidRequest("Missing host in URI".to_string()))?
        .to_string();
    let value = HeaderValue::from_str(&authority)
        .map_err(|e| GateError::InvalidRequest(format!("Invalid host: {}", e)))?;
    req.headers_mut().insert(HOST, value);
    Ok(())
}

fn into_origin_form(req: &mut Request<ProxyBody>) -> Result<()> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = path
        .parse()
        .map_err(|_| GateError::InvalidRequest(format!("Invalid path: {}", path)))?;
    *req.uri_mut() = uri;
    Ok(())
}

/// Read an HTTP response head (up to the blank line)
async fn read_response_head(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut buf = [0u8; 512];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("empty CONNECT response");
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_CONNECT_RESPONSE {
            anyhow::bail!("CONNECT response too large");
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Transport that never reaches anything
    pub struct NoopTransport;

    #[async_trait]
    impl UpstreamTransport for NoopTransport {
        async fn connect(&self, target: &Target) -> Result<TcpStream> {
            Err(GateError::ConnectFailed(format!("noop -> {}", target.authority())))
        }

        async fn round_trip(&self, _req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
            Err(GateError::ConnectFailed("noop".to_string()))
        }

        fn kind(&self) -> &'static str {
            "noop"
        }
    }
}
