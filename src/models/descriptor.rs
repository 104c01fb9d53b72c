//! Upstream descriptor parsing

use std::fmt;

use tracing::{debug, warn};
use url::Url;

use crate::error::{GateError, Result};

/// Upstream scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Socks5,
    Direct,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Socks5 => "socks5",
            Scheme::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "socks5" => Some(Scheme::Socks5),
            "direct" => Some(Scheme::Direct),
            _ => None,
        }
    }

    /// Port assumed when the descriptor omits one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Scheme::Http => Some(80),
            Scheme::Https => Some(443),
            Scheme::Socks5 => Some(1080),
            Scheme::Direct => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed form of one `scheme://[user[:password]@]host[:port]` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDescriptor {
    /// Canonical descriptor string, the identity of the upstream
    pub address: String,
    pub scheme: Scheme,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl UpstreamDescriptor {
    /// Parse a raw descriptor string
    pub fn parse(raw: &str) -> Result<Self> {
        let address = raw.trim();
        let parse_err = |reason: String| GateError::Parse {
            line: address.to_string(),
            reason,
        };

        let url = Url::parse(address).map_err(|e| parse_err(e.to_string()))?;
        if url.scheme().is_empty() {
            return Err(parse_err("empty scheme".to_string()));
        }

        let scheme = Scheme::from_str(url.scheme())
            .ok_or_else(|| parse_err(format!("unsupported scheme '{}'", url.scheme())))?;

        let host = url
            .host_str()
            .map(|h| {
                h.strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(h)
                    .to_string()
            })
            .unwrap_or_default();

        if scheme != Scheme::Direct && host.is_empty() {
            return Err(parse_err("missing host".to_string()));
        }

        let port = url.port().or_else(|| scheme.default_port());

        let username = if url.username().is_empty() {
            None
        } else {
            Some(url.username().to_string())
        };
        let password = match (&username, url.password()) {
            (None, _) => None,
            (Some(_), p) => Some(p.unwrap_or("").to_string()),
        };

        Ok(Self {
            address: address.to_string(),
            scheme,
            username,
            password,
            host,
            port,
        })
    }

    /// `host:port` of the upstream itself, bracketing IPv6 literals
    pub fn authority(&self) -> Option<String> {
        self.port.map(|port| format_host_port(&self.host, port))
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

impl fmt::Display for UpstreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Format `host:port`, bracketing bare IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Validate the lines of a descriptor source.
///
/// Blank lines and `#` comments are dropped silently; lines that fail to
/// parse are logged and dropped. Order is preserved.
pub fn parse_lines<I, S>(lines: I) -> Vec<UpstreamDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut descriptors = Vec::new();

    for (idx, line) in lines.into_iter().enumerate() {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        debug!("validate upstream format: {}", line);
        match UpstreamDescriptor::parse(line) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => warn!(line = idx + 1, "Skipping upstream line: {}", e),
        }
    }

    descriptors
}
