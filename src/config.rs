use std::env;
use std::net::TcpListener;
use std::str::FromStr;
use std::time::Duration;

use hyper::Uri;
use ipnetwork::IpNetwork;

use crate::error::{GateError, Result};
use crate::proxy::handler::{GatewayHandlerConfig, UserAgentPolicy};
use crate::proxy::health::HealthProbeConfig;
use crate::proxy::rotation::SchedulerPolicy;
use crate::services::{DescriptorSource, HealthMonitorConfig, RefreshConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening socket and request handling
    pub gateway: GatewayConfig,
    /// Descriptor source and refresh cadence
    pub source: SourceConfig,
    /// Health probing
    pub health: HealthConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the gateway (default: 8080)
    pub port: u16,
    pub scheduler: SchedulerPolicy,
    /// Tunnel establishment timeout in seconds
    pub connect_timeout: u64,
    /// Response header timeout in seconds
    pub request_timeout: u64,
    /// Extra CONNECT attempts against other upstreams
    pub max_retries: u32,
    pub user_agent: UserAgentPolicy,
    /// Destinations resolving into these networks skip the upstreams
    pub no_proxy: Vec<IpNetwork>,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// File path or HTTP(S) URL of the descriptor list
    pub location: String,
    /// Refresh interval in seconds
    pub refresh_interval: u64,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Evaluation interval in seconds
    pub check_interval: u64,
    /// Dial timeout in seconds, also used when building upstreams
    pub dial_timeout: u64,
    /// HTTP probe timeout in seconds
    pub probe_timeout: u64,
    pub probe_url: Uri,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            gateway: GatewayConfig {
                host: get_env_or("GATE_HOST", "0.0.0.0"),
                port: parse_env_or("GATE_PORT", "8080")?,
                scheduler: SchedulerPolicy::from_str(&get_env_or("GATE_SCHEDULER", "round-robin"))?,
                connect_timeout: parse_secs_env_or("GATE_CONNECT_TIMEOUT", "10")?,
                request_timeout: parse_secs_env_or("GATE_REQUEST_TIMEOUT", "30")?,
                max_retries: parse_env_or("GATE_MAX_RETRIES", "0")?,
                user_agent: UserAgentPolicy::from_config(
                    env::var("GATE_USER_AGENT").ok().as_deref(),
                    parse_env_or("GATE_RANDOM_UA", "false")?,
                )?,
                no_proxy: parse_no_proxy(&get_env_or("GATE_NO_PROXY", ""))?,
            },
            source: SourceConfig {
                location: get_env_or("GATE_SOURCE", "proxyhosts.txt"),
                refresh_interval: parse_secs_env_or("GATE_REFRESH_INTERVAL", "60")?,
            },
            health: HealthConfig {
                check_interval: parse_secs_env_or("GATE_CHECK_INTERVAL", "300")?,
                dial_timeout: parse_secs_env_or("GATE_DIAL_TIMEOUT", "1")?,
                probe_timeout: parse_secs_env_or("GATE_PROBE_TIMEOUT", "3")?,
                probe_url: parse_probe_url(&get_env_or(
                    "GATE_PROBE_URL",
                    "http://www.gstatic.com/generate_204",
                ))?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Startup checks: the listen address must be bindable and the source
    /// reachable. Returns the resolved source.
    pub async fn validate(&self) -> Result<DescriptorSource> {
        self.check_listen_addr()?;
        DescriptorSource::resolve(
            &self.source.location,
            Duration::from_secs(self.gateway.request_timeout),
        )
        .await
    }

    fn check_listen_addr(&self) -> Result<()> {
        TcpListener::bind(self.listen_addr()).map(drop).map_err(|e| {
            GateError::ConfigValidation(format!("Cannot bind {}: {}", self.listen_addr(), e))
        })
    }

    /// Get the gateway listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.health.dial_timeout)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout)
    }

    pub fn handler_config(&self) -> GatewayHandlerConfig {
        GatewayHandlerConfig {
            connect_timeout: Duration::from_secs(self.gateway.connect_timeout),
            request_timeout: Duration::from_secs(self.gateway.request_timeout),
            max_retries: self.gateway.max_retries,
            user_agent: self.gateway.user_agent.clone(),
            no_proxy: self.gateway.no_proxy.clone(),
        }
    }

    pub fn probe_config(&self) -> HealthProbeConfig {
        HealthProbeConfig {
            dial_timeout: self.dial_timeout(),
            probe_timeout: self.probe_timeout(),
            probe_url: self.health.probe_url.clone(),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            refresh_interval: Duration::from_secs(self.source.refresh_interval),
        }
    }

    pub fn monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            check_interval: Duration::from_secs(self.health.check_interval),
        }
    }
}

fn parse_no_proxy(raw: &str) -> Result<Vec<IpNetwork>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|cidr| {
            cidr.parse::<IpNetwork>().map_err(|e| {
                GateError::ConfigValidation(format!("GATE_NO_PROXY has invalid CIDR {}: {}", cidr, e))
            })
        })
        .collect()
}

fn parse_probe_url(raw: &str) -> Result<Uri> {
    let uri: Uri = raw.parse().map_err(|e| {
        GateError::ConfigValidation(format!("GATE_PROBE_URL must be a valid URL: {}", e))
    })?;
    match (uri.scheme_str(), uri.host()) {
        (Some("http") | Some("https"), Some(_)) => Ok(uri),
        _ => Err(GateError::ConfigValidation(
            "GATE_PROBE_URL must be an absolute http(s) URL".into(),
        )),
    }
}

/// Parse an environment variable, falling back to `default` when unset
fn parse_env_or<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim()
        .parse()
        .map_err(|_| GateError::ConfigValidation(format!("{} has invalid value '{}'", key, raw)))
}

/// Parse a duration in whole seconds; zero is rejected
fn parse_secs_env_or(key: &str, default: &str) -> Result<u64> {
    match parse_env_or(key, default)? {
        0 => Err(GateError::ConfigValidation(format!(
            "{} must be greater than zero",
            key
        ))),
        secs => Ok(secs),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
