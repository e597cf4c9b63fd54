//! Outbound dialing for peakroute
//!
//! Every outbound connection goes through a [`Dialer`]. Layers compose by
//! ownership: the base proxy dialer owns the direct dialer, the fixed-host
//! dialer owns whatever it wraps, and the upstream proxy dialer in
//! `peakroute-proxy` sits on top of the base chain.
//!
//! ```text
//! DirectDialer -> [ProxyDialer] -> [FixedDialer]   (management API)
//! DirectDialer -> [ProxyDialer] -> UpstreamDialer  (client traffic)
//! ```

mod addr;
mod auth;
pub mod connect;
pub mod context;
pub mod dialer;
pub mod direct;
pub mod error;
pub mod fixed;
pub mod proxy;
pub mod tls;

pub use addr::{join_host_port, split_host_port};
pub use auth::basic_auth;
pub use connect::http_connect;
pub use context::{Interrupted, OpContext};
pub use dialer::{BoxedStream, Dialer, Network, Stream};
pub use direct::DirectDialer;
pub use error::DialError;
pub use fixed::FixedDialer;
pub use proxy::{build_base_dialer, ProxyDialer, ProxyScheme, ProxyUrl, ProxyUrlError};
