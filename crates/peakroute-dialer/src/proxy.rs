//! Base proxy chain
//!
//! An optional user-supplied proxy that every outbound dial goes through
//! first. Supported schemes:
//!
//! - `http://[user:pass@]host[:port]` CONNECT over plain TCP (default port 80)
//! - `https://[user:pass@]host[:port]` CONNECT over TLS (default port 443)
//! - `socks5://[user:pass@]host[:port]` SOCKS5, target resolved locally (default port 1080)
//! - `socks5h://[user:pass@]host[:port]` SOCKS5, target resolved by the proxy

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use rustls::ClientConfig;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info};

use crate::addr::{join_host_port, split_host_port};
use crate::auth::basic_auth;
use crate::connect::http_connect;
use crate::context::OpContext;
use crate::dialer::{BoxedStream, Dialer, Network};
use crate::direct::DirectDialer;
use crate::error::DialError;
use crate::tls;

#[derive(Debug, Error)]
pub enum ProxyUrlError {
    #[error("malformed proxy URL: {0}")]
    Malformed(#[from] url::ParseError),

    #[error("unsupported proxy scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("proxy URL has no host")]
    MissingHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
    Socks5h,
}

impl ProxyScheme {
    fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => 1080,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
        }
    }
}

impl FromStr for ProxyScheme {
    type Err = ProxyUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks5" => Ok(ProxyScheme::Socks5),
            "socks5h" => Ok(ProxyScheme::Socks5h),
            other => Err(ProxyUrlError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed base proxy URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyUrl {
    /// `host:port` of the proxy itself
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl fmt::Display for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.address())
    }
}

impl FromStr for ProxyUrl {
    type Err = ProxyUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s)?;
        let scheme: ProxyScheme = url.scheme().parse()?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(ProxyUrlError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let credentials = if url.username().is_empty() {
            None
        } else {
            let decode = |raw: &str| percent_decode_str(raw).decode_utf8_lossy().into_owned();
            Some(ProxyCredentials {
                username: decode(url.username()),
                password: url.password().map(decode).unwrap_or_default(),
            })
        };

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
        })
    }
}

/// Dials every target through one configured proxy
pub struct ProxyDialer {
    proxy: ProxyUrl,
    next: Box<dyn Dialer>,
    tls: Option<Arc<ClientConfig>>,
}

impl ProxyDialer {
    pub fn new(proxy: ProxyUrl, next: Box<dyn Dialer>) -> Self {
        let tls = match proxy.scheme {
            ProxyScheme::Https => {
                let mut roots = tls::platform_roots();
                if roots.is_empty() {
                    tls::add_bundled_roots(&mut roots);
                }
                Some(tls::client_config(roots))
            }
            _ => None,
        };

        Self { proxy, next, tls }
    }

    /// Replace the TLS config used to reach an `https` proxy
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn proxy(&self) -> &ProxyUrl {
        &self.proxy
    }

    async fn dial_http(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        let mut stream = self
            .next
            .dial(ctx, network, &self.proxy.address())
            .await?;

        if let Some(config) = &self.tls {
            stream = Box::new(tls::handshake(ctx, config.clone(), &self.proxy.host, stream).await?);
        }

        let authorization = self
            .proxy
            .credentials
            .as_ref()
            .map(|c| basic_auth(&c.username, &c.password));

        http_connect(ctx, &mut stream, address, authorization.as_deref()).await?;
        Ok(stream)
    }

    async fn dial_socks(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        let (host, port) = split_host_port(address)?;

        let resolved = if self.proxy.scheme == ProxyScheme::Socks5 {
            Some(resolve_locally(ctx, network, host, port).await?)
        } else {
            None
        };

        let socket = self
            .next
            .dial(ctx, network, &self.proxy.address())
            .await?;

        let handshake = async {
            match (&self.proxy.credentials, resolved) {
                (Some(c), Some(addr)) => {
                    Socks5Stream::connect_with_password_and_socket(
                        socket, addr, &c.username, &c.password,
                    )
                    .await
                }
                (Some(c), None) => {
                    Socks5Stream::connect_with_password_and_socket(
                        socket,
                        (host, port),
                        &c.username,
                        &c.password,
                    )
                    .await
                }
                (None, Some(addr)) => Socks5Stream::connect_with_socket(socket, addr).await,
                (None, None) => Socks5Stream::connect_with_socket(socket, (host, port)).await,
            }
        };

        let stream = ctx
            .run(handshake)
            .await?
            .map_err(|e| DialError::ProxyHandshake(format!("SOCKS5: {}", e)))?;

        Ok(Box::new(stream))
    }
}

async fn resolve_locally(
    ctx: &OpContext,
    network: Network,
    host: &str,
    port: u16,
) -> Result<SocketAddr, DialError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs = ctx
        .run(tokio::net::lookup_host((host, port)))
        .await?
        .map_err(|source| DialError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .into_iter()
        .find(|addr| network.accepts(addr))
        .ok_or_else(|| DialError::NoAddresses(host.to_string()))
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        debug!(proxy = %self.proxy, target = %address, "Dialing through base proxy");
        match self.proxy.scheme {
            ProxyScheme::Http | ProxyScheme::Https => self.dial_http(ctx, network, address).await,
            ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
                self.dial_socks(ctx, network, address).await
            }
        }
    }
}

/// Build the base dialer chain: direct, optionally behind one proxy.
///
/// The proxy URL is parsed here so a bad value fails at startup rather than
/// on first use.
pub fn build_base_dialer(
    proxy: Option<&str>,
    connect_timeout: Duration,
) -> Result<Arc<dyn Dialer>, ProxyUrlError> {
    let direct = DirectDialer::new().with_connect_timeout(connect_timeout);

    match proxy {
        None => Ok(Arc::new(direct)),
        Some(raw) => {
            let proxy: ProxyUrl = raw.parse()?;
            info!(proxy = %proxy, "Routing outbound connections through base proxy");
            Ok(Arc::new(ProxyDialer::new(proxy, Box::new(direct))))
        }
    }
}
