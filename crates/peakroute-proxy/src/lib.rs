//! Local HTTP proxy in front of the authenticated backend endpoint
//!
//! - [`UpstreamDialer`] opens TLS to the discovered endpoint and asks it to
//!   CONNECT onward, with the session read fresh on every dial
//! - [`ProxyServer`] accepts local clients, forwarding plain requests and
//!   relaying CONNECT tunnels
//! - [`Refresher`] re-runs discovery in the background

pub mod error;
pub mod refresher;
pub mod relay;
pub mod server;
pub mod trust;
pub mod upstream;

pub use error::{ServerError, TrustError, UpstreamError};
pub use refresher::{RefreshSchedule, RefreshState, Refresher};
pub use relay::{relay, RelayStats};
pub use server::{ProxyServer, ProxyServerConfig};
pub use trust::{bundled_intermediates, load_ca_file, TrustConfig};
pub use upstream::{EndpointSource, SessionProvider, UpstreamDialer};
