//! Domain and wire types

use peakroute_dialer::{basic_auth, join_host_port};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend proxy endpoint returned by discovery
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub addresses: Vec<String>,
    pub protocol: String,
}

impl Endpoint {
    /// `host:port`; the name used for TLS verification
    pub fn net_addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// `ip:port` of the first address, the literal dial target
    pub fn dial_addr(&self) -> Option<String> {
        self.addresses
            .first()
            .map(|ip| join_host_port(ip, self.port))
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addresses.first() {
            Some(ip) if ip != &self.host => write!(f, "{} ({})", self.net_addr(), ip),
            _ => f.write_str(&self.net_addr()),
        }
    }
}

/// Upstream proxy credentials for this device
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic ...` header value
    pub fn basic_auth(&self) -> String {
        basic_auth(&self.username, &self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Endpoint and credentials from one discovery; always replaced together
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxySession {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoEntry {
    #[serde(default)]
    pub proxy_type: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country_code: String,
}

// Wire envelope: {"success": bool, "data": ..., "errors": [{"name", "message"}]}

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<WireError>,
}

impl Envelope {
    pub fn first_error(&self) -> String {
        self.errors
            .first()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterData {
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeoListData {
    #[serde(default)]
    pub locations: Vec<GeoEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DiscoverData {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
}

impl DiscoverData {
    pub fn into_parts(self) -> (Endpoint, Credentials) {
        let host = self
            .host
            .filter(|h| !h.is_empty())
            .or_else(|| self.addresses.first().cloned())
            .unwrap_or_default();

        let endpoint = Endpoint {
            host,
            port: self.port,
            addresses: self.addresses,
            protocol: self.protocol,
        };
        (endpoint, Credentials::new(self.username, self.password))
    }
}
