use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("endpoint has no addresses")]
    EmptyEndpoint,

    #[error("invalid endpoint address {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("failed to read CA file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("invalid CA certificate: {0}")]
    Invalid(#[from] rustls::Error),

    #[error("unusable trust store: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },
}
