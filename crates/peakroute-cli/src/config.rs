//! Command line and config file handling
//!
//! Values are layered: command line first, then the YAML file given with
//! `--config`, then built-in defaults.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_COUNTRY: &str = "nl";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:18090";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_REFRESH_RETRY: Duration = Duration::from_secs(5);

/// Local HTTP proxy that forwards through the antpeak.com VPN backend
#[derive(Parser, Debug, Default)]
#[command(name = "peakroute")]
#[command(version)]
#[command(long_about = r#"
peakroute registers a virtual device with the antpeak.com backend, discovers
the proxy endpoint for the chosen country and serves a local HTTP proxy
(plain requests and CONNECT) that forwards every request through it.

EXAMPLES:
  # Serve a proxy on 127.0.0.1:18090 exiting in the Netherlands
  peakroute --country nl

  # List available countries as CSV
  peakroute --list-countries

  # Reach the backend through a local SOCKS proxy
  peakroute --proxy socks5h://127.0.0.1:9050

  # Load settings from a file, overriding the log level
  peakroute --config peakroute.yaml --log-level debug

ENVIRONMENT VARIABLES:
  PEAKROUTE_COUNTRY       Desired proxy location
  PEAKROUTE_BIND_ADDRESS  HTTP proxy listen address
  PEAKROUTE_PROXY         Base proxy URL
  RUST_LOG                Log filter, overrides --log-level
"#)]
pub struct Cli {
    /// Desired proxy location [default: nl]
    #[arg(long, env = "PEAKROUTE_COUNTRY")]
    pub country: Option<String>,

    /// List available countries and exit
    #[arg(long)]
    pub list_countries: bool,

    /// HTTP proxy listen address [default: 127.0.0.1:18090]
    #[arg(long, env = "PEAKROUTE_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Timeout for network operations, e.g. 10s [default: 10s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Base proxy for all dial-outs: <http|https|socks5|socks5h>://[login:password@]host[:port]
    #[arg(long, env = "PEAKROUTE_PROXY")]
    pub proxy: Option<String>,

    /// Override IP address of the API host
    #[arg(long, conflicts_with = "bootstrap_dns")]
    pub api_address: Option<String>,

    /// DNS/DoH/DoT/DoQ resolver for discovering the API address, e.g. https://1.1.1.1/dns-query
    #[arg(long)]
    pub bootstrap_dns: Option<String>,

    /// Login refresh interval [default: 4h]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub refresh: Option<Duration>,

    /// Login refresh retry interval [default: 5s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub refresh_retry: Option<Duration>,

    /// Trust bundled Mozilla roots in addition to the system store [default: true]
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub certchain_workaround: Option<bool>,

    /// Custom CA certificate bundle (PEM) for the proxy endpoint
    #[arg(long)]
    pub cafile: Option<PathBuf>,

    /// Follow endpoint changes found by the refresher instead of pinning the first one
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub follow_endpoint: Option<bool>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub country: Option<String>,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub timeout: Option<String>,
    pub proxy: Option<String>,
    pub api_address: Option<String>,
    pub bootstrap_dns: Option<String>,
    pub refresh: Option<String>,
    pub refresh_retry: Option<String>,
    pub certchain_workaround: Option<bool>,
    pub cafile: Option<PathBuf>,
    pub follow_endpoint: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid duration for {key}: {value:?}")]
    InvalidDuration { key: &'static str, value: String },

    #[error("Country can't be empty string")]
    EmptyCountry,

    #[error("api-address and bootstrap-dns options are mutually exclusive")]
    Conflict,

    #[error("Invalid bind address {0:?} (expected ip:port)")]
    InvalidBindAddress(String),

    #[error("Invalid API address {0:?} (expected an IP address)")]
    InvalidApiAddress(String),

    #[error("{key} must be greater than zero")]
    ZeroInterval { key: &'static str },
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::Read { .. }
            | ConfigError::Parse { .. }
            | ConfigError::InvalidDuration { .. } => 3,
            _ => 2,
        }
    }
}

/// Effective settings after merging every source
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub country: String,
    pub list_countries: bool,
    pub bind_address: SocketAddr,
    pub log_level: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub api_address: Option<IpAddr>,
    pub bootstrap_dns: Option<String>,
    pub refresh: Duration,
    pub refresh_retry: Duration,
    pub certchain_workaround: bool,
    pub cafile: Option<PathBuf>,
    pub follow_endpoint: bool,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn file_duration(key: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|raw| {
            humantime::parse_duration(raw.trim())
                .map_err(|_| ConfigError::InvalidDuration { key, value: raw })
        })
        .transpose()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Settings {
    /// Merge CLI args with the config file, giving precedence to CLI args
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => load_config_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let timeout = file_duration("timeout", file.timeout)?;
        let refresh = file_duration("refresh", file.refresh)?;
        let refresh_retry = file_duration("refresh_retry", file.refresh_retry)?;

        let country = cli
            .country
            .or(file.country)
            .unwrap_or_else(|| DEFAULT_COUNTRY.to_string());
        if country.is_empty() {
            return Err(ConfigError::EmptyCountry);
        }

        // an empty value disables the option, as if it had not been given
        let proxy = non_empty(cli.proxy.or(file.proxy));
        let api_address = non_empty(cli.api_address.or(file.api_address));
        let bootstrap_dns = non_empty(cli.bootstrap_dns.or(file.bootstrap_dns));
        if api_address.is_some() && bootstrap_dns.is_some() {
            return Err(ConfigError::Conflict);
        }
        let api_address = api_address
            .map(|raw| {
                raw.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidApiAddress(raw))
            })
            .transpose()?;

        let bind_address = cli
            .bind_address
            .or(file.bind_address)
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let bind_address = bind_address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBindAddress(bind_address.clone()))?;

        let refresh = cli.refresh.or(refresh).unwrap_or(DEFAULT_REFRESH);
        if refresh.is_zero() {
            return Err(ConfigError::ZeroInterval { key: "refresh" });
        }
        let refresh_retry = cli
            .refresh_retry
            .or(refresh_retry)
            .unwrap_or(DEFAULT_REFRESH_RETRY);
        if refresh_retry.is_zero() {
            return Err(ConfigError::ZeroInterval {
                key: "refresh-retry",
            });
        }

        Ok(Settings {
            country,
            list_countries: cli.list_countries,
            bind_address,
            log_level: cli
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            timeout: cli.timeout.or(timeout).unwrap_or(DEFAULT_TIMEOUT),
            proxy,
            api_address,
            bootstrap_dns,
            refresh,
            refresh_retry,
            certchain_workaround: cli
                .certchain_workaround
                .or(file.certchain_workaround)
                .unwrap_or(true),
            cafile: cli.cafile.or(file.cafile),
            follow_endpoint: cli
                .follow_endpoint
                .or(file.follow_endpoint)
                .unwrap_or(false),
        })
    }
}
