//! Management API client for peakroute
//!
//! Registers a virtual device, lists regions, and discovers the backend proxy
//! endpoint for a region. Every call runs over a caller-supplied
//! [`peakroute_dialer::Dialer`], so the base proxy chain and the fixed-host
//! override apply to API traffic too.

pub mod cell;
pub mod client;
pub mod error;
pub mod types;

pub use cell::SharedCell;
pub use client::{ApiClient, ApiEndpoints, ApiSettings, API_DOMAIN};
pub use error::ApiError;
pub use types::{Credentials, Endpoint, GeoEntry, ProxySession};

use async_trait::async_trait;
use peakroute_dialer::OpContext;

/// Operations the proxy core needs from the management backend
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Register this device and obtain an access token
    async fn register_device(&self, ctx: &OpContext) -> Result<(), ApiError>;

    /// List the regions the backend offers
    async fn geo_list(&self, ctx: &OpContext) -> Result<Vec<GeoEntry>, ApiError>;

    /// Discover the proxy endpoint for `region`.
    ///
    /// A non-empty answer replaces the stored [`ProxySession`] in one step.
    async fn discover(&self, ctx: &OpContext, region: &str) -> Result<Endpoint, ApiError>;

    /// Endpoint and credentials stored by the last successful discovery
    fn proxy_session(&self) -> ProxySession;

    fn proxy_credentials(&self) -> Credentials {
        self.proxy_session().credentials
    }
}
