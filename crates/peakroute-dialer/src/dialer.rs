//! The dialer capability

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::context::OpContext;
use crate::error::DialError;

/// A duplex byte stream returned by a dial
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

/// Network family requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    /// Whether `addr` belongs to this family
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }
}

/// Opens outbound connections.
///
/// Implementations must be safe to call concurrently and must abort promptly
/// when `ctx` is cancelled or its deadline passes.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        (**self).dial(ctx, network, address).await
    }
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Box<D> {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        (**self).dial(ctx, network, address).await
    }
}
