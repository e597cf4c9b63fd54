//! Fixed-host override

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::trace;

use crate::addr::{join_host_port, split_host_port};
use crate::context::OpContext;
use crate::dialer::{BoxedStream, Dialer, Network};
use crate::error::DialError;

/// Pins one hostname to a literal IP and passes every other address through.
pub struct FixedDialer<D> {
    hostname: String,
    ip: IpAddr,
    next: D,
}

impl<D: Dialer> FixedDialer<D> {
    pub fn new(hostname: impl Into<String>, ip: IpAddr, next: D) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
            next,
        }
    }

    /// The address actually dialed for `address`
    pub fn rewrite(&self, address: &str) -> Result<String, DialError> {
        let (host, port) = split_host_port(address)?;
        if host.eq_ignore_ascii_case(&self.hostname) {
            Ok(join_host_port(&self.ip.to_string(), port))
        } else {
            Ok(address.to_string())
        }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for FixedDialer<D> {
    async fn dial(
        &self,
        ctx: &OpContext,
        network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        let target = self.rewrite(address)?;
        if target != address {
            trace!(from = %address, to = %target, "Fixed-host override");
        }
        self.next.dial(ctx, network, &target).await
    }
}
