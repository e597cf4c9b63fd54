//! peakroute command line front end
//!
//! [`config`] merges flags, environment and the optional YAML file into
//! [`config::Settings`]; [`app::run`] performs the startup sequence and serves
//! until interrupted. Every fatal startup failure maps to its own exit status
//! through [`app::StartupError::exit_code`].

pub mod app;
pub mod config;

pub use app::{run, StartupError};
pub use config::{Cli, ConfigError, FileConfig, Settings};
