//! Dial errors

use std::io;
use thiserror::Error;

use crate::context::Interrupted;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable addresses for {0}")]
    NoAddresses(String),

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("dial timed out")]
    Timeout,

    #[error("dial cancelled")]
    Cancelled,

    #[error("proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("proxy authentication required")]
    ProxyAuthRequired,

    #[error("proxy rejected CONNECT with status {status}")]
    ProxyRejected { status: u16 },

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DialError {
    /// Whether the dial stopped because its deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout)
    }
}

impl From<Interrupted> for DialError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => DialError::Cancelled,
            Interrupted::DeadlineExceeded => DialError::Timeout,
        }
    }
}
