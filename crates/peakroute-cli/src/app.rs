//! Startup orchestration

use peakroute_api::{ApiClient, ApiError, ApiSettings, ManagementApi, API_DOMAIN};
use peakroute_dialer::{build_base_dialer, Dialer, FixedDialer, OpContext, ProxyUrlError};
use peakroute_proxy::{
    load_ca_file, EndpointSource, ProxyServer, ProxyServerConfig, RefreshSchedule, Refresher,
    ServerError, SessionProvider, TrustConfig, TrustError, UpstreamDialer, UpstreamError,
};
use peakroute_resolver::{BootstrapResolver, ResolverError, UpstreamResolver};
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigError, Settings};

/// TCP connect timeout for the direct dialer under every chain
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A fatal startup failure; each class exits with its own status
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unable to instantiate DNS resolver: {0}")]
    Resolver(#[source] ResolverError),

    #[error("Unable to instantiate base proxy dialer: {0}")]
    BaseProxy(#[source] ProxyUrlError),

    #[error("Unable to construct API client: {0}")]
    ApiClient(#[source] ApiError),

    #[error("Unable to perform device registration: {0}")]
    Registration(#[source] ApiError),

    #[error("Unable to list countries: {0}")]
    GeoList(#[source] ApiError),

    #[error("Unable to write country list: {0}")]
    Output(#[source] std::io::Error),

    #[error("Endpoint discovery failed: {0}")]
    Discovery(#[source] ApiError),

    #[error("Empty endpoint")]
    EmptyEndpoint,

    #[error("Unusable endpoint: {0}")]
    Endpoint(#[source] UpstreamError),

    #[error("Unable to resolve {0} with specified bootstrap DNS")]
    BootstrapUnresolved(String),

    #[error("Can't load CA file: {0}")]
    CaFile(#[source] TrustError),

    #[error("Unable to set up endpoint certificate verification: {0}")]
    Trust(#[source] TrustError),

    #[error("Server terminated with a reason: {0}")]
    Server(#[source] ServerError),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(e) => e.exit_code(),
            StartupError::Resolver(_) => 4,
            StartupError::BaseProxy(ProxyUrlError::UnsupportedScheme(_)) => 7,
            StartupError::BaseProxy(_) => 6,
            StartupError::ApiClient(_) => 8,
            StartupError::Registration(_) => 10,
            StartupError::GeoList(_) | StartupError::Output(_) => 11,
            StartupError::Discovery(_) => 12,
            StartupError::EmptyEndpoint | StartupError::Endpoint(_) => 13,
            StartupError::BootstrapUnresolved(_) => 14,
            StartupError::CaFile(_) | StartupError::Trust(_) => 15,
            StartupError::Server(_) => 16,
        }
    }
}

/// Run until Ctrl-C or a fatal error
pub async fn run(settings: Settings) -> Result<(), StartupError> {
    info!("peakroute {} is starting...", env!("CARGO_PKG_VERSION"));

    let base = build_base_dialer(settings.proxy.as_deref(), CONNECT_TIMEOUT)
        .map_err(StartupError::BaseProxy)?;

    let api_dialer = api_dialer(&settings, base.clone()).await?;
    let api = Arc::new(
        ApiClient::new(api_dialer, ApiSettings::default()).map_err(StartupError::ApiClient)?,
    );

    api.register_device(&OpContext::with_timeout(settings.timeout))
        .await
        .map_err(StartupError::Registration)?;
    info!("Device registered");

    if settings.list_countries {
        let mut csv = Vec::new();
        print_countries(api.as_ref(), settings.timeout, &mut csv).await?;
        return std::io::stdout()
            .write_all(&csv)
            .map_err(StartupError::Output);
    }

    let endpoint = api
        .discover(&OpContext::with_timeout(settings.timeout), &settings.country)
        .await
        .map_err(StartupError::Discovery)?;
    if endpoint.is_empty() {
        return Err(StartupError::EmptyEndpoint);
    }

    let trust = trust_config(&settings)?;
    let source = if settings.follow_endpoint {
        EndpointSource::Live
    } else {
        EndpointSource::pinned(&endpoint).map_err(StartupError::Endpoint)?
    };

    let sessions: SessionProvider = {
        let api = api.clone();
        Arc::new(move || api.proxy_session())
    };
    let upstream =
        UpstreamDialer::new(source, sessions, &trust, base).map_err(StartupError::Trust)?;

    let shutdown = CancellationToken::new();
    let refresher = Refresher::new(
        api.clone(),
        settings.country.clone(),
        RefreshSchedule {
            success: settings.refresh,
            retry: settings.refresh_retry,
        },
        settings.timeout,
    )
    .spawn(shutdown.child_token());

    info!("Endpoint: {}", endpoint);
    info!("Starting proxy server...");
    let server = ProxyServer::new(
        ProxyServerConfig::new(settings.bind_address).with_dial_timeout(settings.timeout),
        Arc::new(upstream),
    )
    .with_shutdown(shutdown.clone());
    info!("Init complete.");

    let result = tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    shutdown.cancel();
    join_refresher(refresher).await;
    info!("Shutting down...");

    result.map_err(StartupError::Server)
}

/// Wait for the refresher task; false when it panicked or was aborted
async fn join_refresher(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Endpoint refresher ended abnormally");
            false
        }
    }
}

/// Dialer for API traffic: the base chain, with the API host pinned when
/// an address was given or bootstrapped
async fn api_dialer(
    settings: &Settings,
    base: Arc<dyn Dialer>,
) -> Result<Arc<dyn Dialer>, StartupError> {
    let ip = if let Some(ip) = settings.api_address {
        info!("Using fixed API host IP address = {}", ip);
        ip
    } else if let Some(url) = &settings.bootstrap_dns {
        let resolver = UpstreamResolver::new(url, settings.timeout)
            .await
            .map_err(StartupError::Resolver)?;
        bootstrap_api_address(&resolver).await?
    } else {
        return Ok(base);
    };

    Ok(Arc::new(FixedDialer::new(API_DOMAIN, ip, base)))
}

/// First A record of the API host from the bootstrap resolver
pub async fn bootstrap_api_address(
    resolver: &dyn BootstrapResolver,
) -> Result<IpAddr, StartupError> {
    info!("Discovering API IP address...");

    let ip = resolver
        .resolve_a(API_DOMAIN)
        .await
        .first()
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .ok_or_else(|| StartupError::BootstrapUnresolved(API_DOMAIN.to_string()))?;

    info!("Discovered address of API host = {}", ip);
    Ok(ip)
}

fn trust_config(settings: &Settings) -> Result<TrustConfig, StartupError> {
    let trust = TrustConfig::new(settings.certchain_workaround);
    match &settings.cafile {
        Some(path) => {
            let pool = load_ca_file(path).map_err(StartupError::CaFile)?;
            info!("Using CA bundle {}", path.display());
            Ok(trust.with_ca_pool(pool))
        }
        None => Ok(trust),
    }
}

/// Write the country list as CSV: a header, then one row per plain proxy location
pub async fn print_countries<W: Write>(
    api: &dyn ManagementApi,
    timeout: Duration,
    out: &mut W,
) -> Result<(), StartupError> {
    let list = api
        .geo_list(&OpContext::with_timeout(timeout))
        .await
        .map_err(StartupError::GeoList)?;

    write_csv_record(out, &["country code", "country name"]).map_err(StartupError::Output)?;
    for entry in list.iter().filter(|entry| entry.proxy_type == 0) {
        write_csv_record(out, &[&entry.region, &entry.name]).map_err(StartupError::Output)?;
    }
    out.flush().map_err(StartupError::Output)
}

fn write_csv_record<W: Write>(out: &mut W, fields: &[&str]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(out, "{}", line)
}

fn csv_field(field: &str) -> String {
    if field.contains(&[',', '"', '\r', '\n'][..]) || field.starts_with(' ') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
