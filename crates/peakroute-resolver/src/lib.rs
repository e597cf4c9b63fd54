//! Bootstrap name resolution
//!
//! Resolves the management API hostname once at startup through a
//! user-chosen DNS upstream, so a poisoned or censored system resolver can be
//! bypassed. Accepted upstream forms:
//!
//! | form | transport | default port |
//! |---|---|---|
//! | `host[:port]` | plain UDP | 53 |
//! | `udp://host[:port]` | plain UDP | 53 |
//! | `tcp://host[:port]` | plain TCP | 53 |
//! | `tls://host[:port]` | DNS over TLS | 853 |
//! | `https://host[:port][/dns-query]` | DNS over HTTPS | 443 |
//! | `quic://host[:port]` | DNS over QUIC | 853 |

use async_trait::async_trait;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig,
    ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid resolver URL {0:?}")]
    InvalidUrl(String),

    #[error("unsupported resolver scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("failed to resolve resolver host {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resolver host {0} has no addresses")]
    NoAddresses(String),
}

/// One-shot A record lookups
#[async_trait]
pub trait BootstrapResolver: Send + Sync {
    /// IPv4 addresses for `domain` in answer order; empty on any failure
    async fn resolve_a(&self, domain: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
}

impl Transport {
    fn default_port(&self) -> u16 {
        match self {
            Transport::Udp | Transport::Tcp => 53,
            Transport::Tls | Transport::Quic => 853,
            Transport::Https => 443,
        }
    }
}

/// A parsed resolver upstream URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUrl {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl UpstreamUrl {
    pub fn parse(raw: &str) -> Result<Self, ResolverError> {
        let invalid = || ResolverError::InvalidUrl(raw.to_string());

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("udp://{}", raw)
        };
        let url = url::Url::parse(&with_scheme).map_err(|_| invalid())?;

        let transport = match url.scheme() {
            "udp" | "dns" => Transport::Udp,
            "tcp" => Transport::Tcp,
            "tls" | "dot" => Transport::Tls,
            "https" | "doh" => Transport::Https,
            "quic" | "doq" => Transport::Quic,
            other => return Err(ResolverError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        if transport == Transport::Https && !matches!(url.path(), "" | "/" | "/dns-query") {
            warn!(path = %url.path(), "DoH path is ignored, /dns-query is always used");
        }

        Ok(Self {
            transport,
            port: url.port().unwrap_or_else(|| transport.default_port()),
            host,
        })
    }
}

/// Resolver backed by hickory, pointed at a single upstream
pub struct UpstreamResolver {
    inner: TokioAsyncResolver,
    upstream: UpstreamUrl,
}

impl UpstreamResolver {
    /// Build a resolver for `url`.
    ///
    /// A hostname in `url` is looked up once with the system resolver; the
    /// name is kept for TLS verification of encrypted transports.
    pub async fn new(url: &str, timeout: Duration) -> Result<Self, ResolverError> {
        let upstream = UpstreamUrl::parse(url)?;
        let ips = upstream_ips(&upstream).await?;
        debug!(upstream = ?upstream, ips = ?ips, "Bootstrap resolver configured");

        let group = name_servers(&upstream, &ips);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;

        Ok(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
            upstream,
        })
    }

    pub fn upstream(&self) -> &UpstreamUrl {
        &self.upstream
    }
}

async fn upstream_ips(upstream: &UpstreamUrl) -> Result<Vec<IpAddr>, ResolverError> {
    if let Ok(ip) = upstream.host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = tokio::net::lookup_host((upstream.host.as_str(), upstream.port))
        .await
        .map_err(|source| ResolverError::Lookup {
            host: upstream.host.clone(),
            source,
        })?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }

    if ips.is_empty() {
        return Err(ResolverError::NoAddresses(upstream.host.clone()));
    }
    Ok(ips)
}

fn name_servers(upstream: &UpstreamUrl, ips: &[IpAddr]) -> NameServerConfigGroup {
    let port = upstream.port;
    let tls_name = upstream.host.clone();

    match upstream.transport {
        Transport::Udp | Transport::Tcp => {
            let protocol = if upstream.transport == Transport::Udp {
                Protocol::Udp
            } else {
                Protocol::Tcp
            };
            let servers: Vec<NameServerConfig> = ips
                .iter()
                .map(|ip| NameServerConfig::new((*ip, port).into(), protocol))
                .collect();
            NameServerConfigGroup::from(servers)
        }
        Transport::Tls => NameServerConfigGroup::from_ips_tls(ips, port, tls_name, true),
        Transport::Https => NameServerConfigGroup::from_ips_https(ips, port, tls_name, true),
        Transport::Quic => NameServerConfigGroup::from_ips_quic(ips, port, tls_name, true),
    }
}

#[async_trait]
impl BootstrapResolver for UpstreamResolver {
    async fn resolve_a(&self, domain: &str) -> Vec<String> {
        match self.inner.ipv4_lookup(domain).await {
            Ok(lookup) => lookup.iter().map(|a| a.0.to_string()).collect(),
            Err(e) => {
                warn!(domain = %domain, error = %e, "Bootstrap lookup failed");
                Vec::new()
            }
        }
    }
}
