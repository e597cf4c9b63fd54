//! Authenticated TLS dialer for the backend proxy endpoint

use async_trait::async_trait;
use peakroute_api::{Endpoint, ProxySession};
use peakroute_dialer::{
    http_connect, join_host_port, split_host_port, tls, BoxedStream, DialError, Dialer, Network,
    OpContext,
};
use rustls::ClientConfig;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{TrustError, UpstreamError};
use crate::trust::TrustConfig;

/// Returns the endpoint and credentials current at call time, as one snapshot
pub type SessionProvider = Arc<dyn Fn() -> ProxySession + Send + Sync>;

/// Where the upstream dialer connects.
///
/// `Pinned` keeps the endpoint captured at startup for the process lifetime.
/// `Live` takes the endpoint from the same session snapshot as the
/// credentials, so each dial follows the latest discovery.
#[derive(Debug, Clone)]
pub enum EndpointSource {
    Pinned { host_port: String, ip: IpAddr },
    Live,
}

/// TLS server name plus literal dial address for one dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub server_name: String,
    pub dial_addr: String,
}

impl EndpointSource {
    /// Pin `endpoint` using its first address
    pub fn pinned(endpoint: &Endpoint) -> Result<Self, UpstreamError> {
        let ip = endpoint
            .addresses
            .first()
            .ok_or(UpstreamError::EmptyEndpoint)?;
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| UpstreamError::InvalidAddress(ip.clone()))?;

        Ok(EndpointSource::Pinned {
            host_port: endpoint.net_addr(),
            ip,
        })
    }

    pub fn resolve(&self, session: &ProxySession) -> Result<ResolvedEndpoint, DialError> {
        match self {
            EndpointSource::Pinned { host_port, ip } => {
                let (host, port) = split_host_port(host_port)?;
                Ok(ResolvedEndpoint {
                    server_name: host.to_string(),
                    dial_addr: join_host_port(&ip.to_string(), port),
                })
            }
            EndpointSource::Live => {
                let endpoint = &session.endpoint;
                let dial_addr = endpoint
                    .dial_addr()
                    .ok_or_else(|| DialError::NoAddresses(endpoint.net_addr()))?;
                Ok(ResolvedEndpoint {
                    server_name: endpoint.host.clone(),
                    dial_addr,
                })
            }
        }
    }
}

/// Dials targets through the backend endpoint.
///
/// Each dial takes one session snapshot, opens a fresh TLS connection to the
/// endpoint over the base dialer, then issues `CONNECT target` carrying the
/// snapshot's credentials.
pub struct UpstreamDialer {
    source: EndpointSource,
    session: SessionProvider,
    tls: Arc<ClientConfig>,
    next: Arc<dyn Dialer>,
}

impl UpstreamDialer {
    pub fn new(
        source: EndpointSource,
        session: SessionProvider,
        trust: &TrustConfig,
        next: Arc<dyn Dialer>,
    ) -> Result<Self, TrustError> {
        Ok(Self {
            source,
            session,
            tls: trust.client_config()?,
            next,
        })
    }

    pub fn source(&self) -> &EndpointSource {
        &self.source
    }

    /// Open a verified TLS connection to the endpoint `session` selects
    pub async fn connect_endpoint(
        &self,
        ctx: &OpContext,
        session: &ProxySession,
    ) -> Result<BoxedStream, DialError> {
        let endpoint = self.source.resolve(session)?;
        debug!(
            endpoint = %endpoint.dial_addr,
            server_name = %endpoint.server_name,
            "Connecting to upstream endpoint"
        );

        let stream = self
            .next
            .dial(ctx, Network::Tcp, &endpoint.dial_addr)
            .await?;
        let stream = tls::handshake(ctx, self.tls.clone(), &endpoint.server_name, stream).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Dialer for UpstreamDialer {
    async fn dial(
        &self,
        ctx: &OpContext,
        _network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        let session = (self.session)();
        let mut stream = self.connect_endpoint(ctx, &session).await?;
        let authorization = session.credentials.basic_auth();
        http_connect(ctx, &mut stream, address, Some(&authorization)).await?;
        Ok(stream)
    }
}
