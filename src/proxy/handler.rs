//! Gateway request handler
//!
//! Picks one upstream per inbound request and forwards through it: CONNECT
//! requests become byte tunnels, absolute-form requests get one HTTP round
//! trip whose response is streamed back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use hyper::body::Body;
use hyper::{Method, Request, Response};
use ipnetwork::IpNetwork;
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{GateError, Result};
use crate::models::Upstream;
use crate::proxy::pool::PoolManager;
use crate::proxy::resolver::Resolver;
use crate::proxy::rotation::UpstreamSelector;
use crate::proxy::transport::{BoxError, DirectTransport, ProxyBody, Target, UpstreamTransport};
use crate::proxy::tunnel::TunnelHandler;

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.80",
];

/// How the outbound User-Agent header is set
#[derive(Debug, Clone, Default)]
pub enum UserAgentPolicy {
    /// Forward whatever the client sent
    #[default]
    Passthrough,
    Fixed(HeaderValue),
    /// One browser UA per request from a built-in pool
    Random,
}

impl UserAgentPolicy {
    /// A non-empty fixed value wins over the random pool
    pub fn from_config(fixed: Option<&str>, random: bool) -> Result<Self> {
        match fixed.map(str::trim).filter(|ua| !ua.is_empty()) {
            Some(ua) => HeaderValue::from_str(ua).map(Self::Fixed).map_err(|e| {
                GateError::ConfigValidation(format!("Invalid user agent '{}': {}", ua, e))
            }),
            None if random => Ok(Self::Random),
            None => Ok(Self::Passthrough),
        }
    }

    fn apply(&self, headers: &mut HeaderMap) {
        match self {
            Self::Passthrough => {}
            Self::Fixed(ua) => {
                headers.insert(USER_AGENT, ua.clone());
            }
            Self::Random => {
                if let Some(ua) = BROWSER_USER_AGENTS.choose(&mut rand::thread_rng()) {
                    headers.insert(USER_AGENT, HeaderValue::from_static(*ua));
                }
            }
        }
    }
}

/// Configuration for the gateway handler
#[derive(Debug, Clone)]
pub struct GatewayHandlerConfig {
    /// Bound on opening a tunnel through an upstream
    pub connect_timeout: Duration,
    /// Bound on receiving response headers for a forwarded request
    pub request_timeout: Duration,
    /// Extra CONNECT attempts, each against a freshly picked upstream
    pub max_retries: u32,
    pub user_agent: UserAgentPolicy,
    /// Destinations resolving into these networks are dialed directly
    pub no_proxy: Vec<IpNetwork>,
}

impl Default for GatewayHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 0,
            user_agent: UserAgentPolicy::Passthrough,
            no_proxy: Vec::new(),
        }
    }
}

/// Gateway request handler
pub struct GatewayHandler {
    pool: Arc<PoolManager>,
    selector: Arc<dyn UpstreamSelector>,
    resolver: Arc<dyn Resolver>,
    direct: DirectTransport,
    config: GatewayHandlerConfig,
}

impl GatewayHandler {
    pub fn new(
        pool: Arc<PoolManager>,
        selector: Arc<dyn UpstreamSelector>,
        resolver: Arc<dyn Resolver>,
        config: GatewayHandlerConfig,
    ) -> Self {
        Self {
            pool,
            selector,
            direct: DirectTransport::new(resolver.clone()),
            resolver,
            config,
        }
    }

    /// Handle one inbound proxy request.
    ///
    /// Failures become a plain-text gateway error response; nothing here
    /// tears down the serving connection.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        };

        result.unwrap_or_else(|e| {
            warn!("Request failed: {}", e);
            error_response(&e)
        })
    }

    async fn handle_connect<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
    {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| GateError::InvalidRequest("CONNECT requires host:port".to_string()))?;
        let target = Target::from_authority(&authority)?;

        let stream = self.open_tunnel(&target).await?;

        // The 200 goes out first; the client then switches to raw bytes.
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = TunnelHandler::relay_upgraded(upgraded, stream).await {
                        debug!("Tunnel to {} ended with error: {}", authority, e);
                    }
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        Ok(Response::new(empty_body()))
    }

    async fn open_tunnel(&self, target: &Target) -> Result<TcpStream> {
        if let Some(target) = self.bypass_target(target).await {
            debug!("Bypassing upstreams for {}", target.authority());
            return timeout(self.config.connect_timeout, self.direct.connect(&target))
                .await
                .map_err(|_| GateError::Timeout)?;
        }

        let attempts = self.config.max_retries + 1;
        let mut last_error = GateError::NoUpstreamAvailable;

        for attempt in 1..=attempts {
            let upstream = self.pick()?;
            debug!(
                "CONNECT {} through {} (attempt {}/{})",
                target.authority(),
                upstream.address(),
                attempt,
                attempts
            );

            match timeout(self.config.connect_timeout, upstream.transport().connect(target)).await {
                Ok(Ok(stream)) => {
                    info!(
                        "CONNECT tunnel established through {} to {}",
                        upstream.address(),
                        target.authority()
                    );
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    warn!(
                        "CONNECT through {} failed: {} (attempt {}/{})",
                        upstream.address(),
                        e,
                        attempt,
                        attempts
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        "CONNECT through {} timed out (attempt {}/{})",
                        upstream.address(),
                        attempt,
                        attempts
                    );
                    last_error = GateError::Timeout;
                }
            }
        }

        Err(last_error)
    }

    async fn handle_http<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.uri().authority().is_none() {
            return Err(GateError::InvalidRequest(
                "Proxy requests must use an absolute URI".to_string(),
            ));
        }
        let target = Target::from_uri(req.uri())?;

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);
        self.config.user_agent.apply(&mut parts.headers);
        let outbound = Request::from_parts(parts, body.map_err(Into::<BoxError>::into).boxed_unsync());

        let response = match self.bypass_target(&target).await {
            Some(_) => {
                debug!("Bypassing upstreams for {}", target.authority());
                self.forward(&self.direct, outbound).await?
            }
            None => {
                let upstream = self.pick()?;
                debug!("Forwarding {} through {}", target.authority(), upstream.address());
                self.forward(upstream.transport(), outbound).await?
            }
        };

        debug!("Upstream responded {}", response.status());
        Ok(response)
    }

    async fn forward(
        &self,
        transport: &dyn UpstreamTransport,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>> {
        timeout(self.config.request_timeout, transport.round_trip(req))
            .await
            .map_err(|_| GateError::Timeout)?
    }

    fn pick(&self) -> Result<Arc<Upstream>> {
        self.selector.pick(&self.pool.available())
    }

    /// Resolved target when the destination falls inside a no-proxy network
    async fn bypass_target(&self, target: &Target) -> Option<Target> {
        if self.config.no_proxy.is_empty() {
            return None;
        }

        match self.resolver.resolve(&target.host).await {
            Ok(ip) if self.config.no_proxy.iter().any(|net| net.contains(ip)) => {
                Some(target.clone().with_ip(ip))
            }
            Ok(_) => None,
            Err(e) => {
                debug!("No-proxy check skipped for {}: {}", target.host, e);
                None
            }
        }
    }
}

/// Remove headers that only apply to the client connection
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn error_response(err: &GateError) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", err)))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = err.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::proxy::builder::TransportBuilder;
    use crate::proxy::health::{HealthEvaluator, HealthProbeConfig};
    use crate::proxy::pool::testing::FakeBuilder;
    use crate::proxy::resolver::SystemResolver;
    use crate::proxy::rotation::RoundRobinSelector;

    fn handler_with(pool: Arc<PoolManager>, config: GatewayHandlerConfig) -> GatewayHandler {
        GatewayHandler::new(
            pool,
            Arc::new(RoundRobinSelector::new()),
            Arc::new(SystemResolver),
            config,
        )
    }

    /// Pool holding one direct upstream, already evaluated as available
    async fn direct_pool() -> Arc<PoolManager> {
        let builder = TransportBuilder::new(Duration::from_secs(1), Arc::new(SystemResolver));
        let pool = Arc::new(PoolManager::new(Arc::new(builder)));
        pool.refresh(["direct://0.0.0.0"]).await.unwrap();
        HealthEvaluator::with_network_probe(HealthProbeConfig::default())
            .evaluate(&pool)
            .await;
        pool
    }

    /// Origin that answers every request with the request head it received
    async fn spawn_echo_origin() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        head.len()
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                    stream.write_all(&head).await.unwrap();
                });
            }
        });
        addr
    }

    fn get(uri: &str) -> Request<Empty<Bytes>> {
        Request::get(uri)
            .header(USER_AGENT, "curl/8.0")
            .header("Proxy-Connection", "keep-alive")
            .body(Empty::new())
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_user_agent_policy_from_config() {
        assert!(matches!(
            UserAgentPolicy::from_config(Some("bot/1.0"), true).unwrap(),
            UserAgentPolicy::Fixed(_)
        ));
        assert!(matches!(
            UserAgentPolicy::from_config(Some("  "), true).unwrap(),
            UserAgentPolicy::Random
        ));
        assert!(matches!(
            UserAgentPolicy::from_config(None, false).unwrap(),
            UserAgentPolicy::Passthrough
        ));
    }

    #[test]
    fn test_random_user_agent_comes_from_pool() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        UserAgentPolicy::Random.apply(&mut headers);

        let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(BROWSER_USER_AGENTS.iter().any(|candidate| *candidate == ua));
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("keep-alive"));
        headers.insert("Proxy-Authorization", HeaderValue::from_static("Basic eA=="));
        headers.insert("Accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_service_unavailable() {
        let pool = Arc::new(PoolManager::new(Arc::new(FakeBuilder::default())));
        let handler = handler_with(pool, GatewayHandlerConfig::default());

        let response = handler.handle(get("http://example.com/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let connect = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = handler.handle(connect).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_origin_form_request_is_rejected() {
        let pool = Arc::new(PoolManager::new(Arc::new(FakeBuilder::default())));
        let handler = handler_with(pool, GatewayHandlerConfig::default());

        let response = handler.handle(get("/relative")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_forward_through_direct_upstream_rewrites_user_agent() {
        let origin = spawn_echo_origin().await;
        let config = GatewayHandlerConfig {
            user_agent: UserAgentPolicy::from_config(Some("rotagate-test/1.0"), false).unwrap(),
            ..Default::default()
        };
        let handler = handler_with(direct_pool().await, config);

        let response = handler
            .handle(get(&format!("http://{}/hello?x=1", origin)))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let echoed = body_text(response).await.to_lowercase();
        assert!(echoed.starts_with("get /hello?x=1 http/1.1"));
        assert!(echoed.contains("user-agent: rotagate-test/1.0"));
        assert!(!echoed.contains("curl/8.0"));
        assert!(!echoed.contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_no_proxy_network_bypasses_empty_pool() {
        let origin = spawn_echo_origin().await;
        let pool = Arc::new(PoolManager::new(Arc::new(FakeBuilder::default())));
        let config = GatewayHandlerConfig {
            no_proxy: vec!["127.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        let handler = handler_with(pool, config);

        let response = handler.handle(get(&format!("http://{}/", origin))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("curl/8.0"));
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let handler = handler_with(direct_pool().await, GatewayHandlerConfig::default());
        let response = handler.handle(get(&format!("http://{}/", closed))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
