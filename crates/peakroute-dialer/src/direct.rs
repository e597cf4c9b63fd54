//! Direct TCP dialing

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::addr::split_host_port;
use crate::context::OpContext;
use crate::dialer::{BoxedStream, Dialer, Network};
use crate::error::DialError;

/// Dials the target directly, trying each resolved address in order.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer {
    connect_timeout: Option<Duration>,
}

impl DirectDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each individual connect attempt, independent of the caller's deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn resolve(network: Network, address: &str) -> Result<Vec<SocketAddr>, DialError> {
        let (host, port) = split_host_port(address)?;

        let candidates: Vec<SocketAddr> = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .map_err(|source| DialError::Resolve {
                    host: host.to_string(),
                    source,
                })?
                .collect(),
        };

        let filtered: Vec<SocketAddr> = candidates
            .into_iter()
            .filter(|addr| network.accepts(addr))
            .collect();

        if filtered.is_empty() {
            return Err(DialError::NoAddresses(address.to_string()));
        }
        Ok(filtered)
    }

    async fn connect_one(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let attempt = TcpStream::connect(addr);
        let result = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| DialError::Timeout)?,
            None => attempt.await,
        };

        result.map_err(|source| DialError::Connect {
            address: addr.to_string(),
            source,
        })
    }

    async fn dial_inner(&self, network: Network, address: &str) -> Result<TcpStream, DialError> {
        let addrs = Self::resolve(network, address).await?;

        let mut last_error = None;
        for addr in addrs {
            match self.connect_one(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(target_addr = %addr, "Direct connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target_addr = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DialError::NoAddresses(address.to_string())))
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        let stream = ctx.run(self.dial_inner(network, address)).await??;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_dial_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let dialer = DirectDialer::new();
        let mut stream = dialer
            .dial(&OpContext::background(), Network::Tcp, &addr.to_string())
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_direct_dial_network_mismatch() {
        let dialer = DirectDialer::new();
        let result = dialer
            .dial(&OpContext::background(), Network::Tcp6, "127.0.0.1:80")
            .await;
        assert!(matches!(result, Err(DialError::NoAddresses(_))));
    }

    #[tokio::test]
    async fn test_direct_dial_cancelled() {
        let ctx = OpContext::background();
        ctx.cancel();

        let dialer = DirectDialer::new();
        let result = dialer.dial(&ctx, Network::Tcp, "127.0.0.1:9").await;
        assert!(matches!(result, Err(DialError::Cancelled)));
    }

    #[tokio::test]
    async fn test_direct_dial_invalid_address() {
        let dialer = DirectDialer::new();
        let result = dialer
            .dial(&OpContext::background(), Network::Tcp, "no-port")
            .await;
        assert!(matches!(result, Err(DialError::InvalidAddress(_))));
    }
}
