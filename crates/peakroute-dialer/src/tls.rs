//! TLS plumbing shared by every layer that wraps a stream in TLS

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::sync::{Arc, Once};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::context::OpContext;
use crate::dialer::BoxedStream;
use crate::error::DialError;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Install ring as the process-wide rustls provider (idempotent)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Roots from the platform trust store. Unreadable entries are skipped.
pub fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();

    for error in &loaded.errors {
        warn!(error = %error, "Failed to load some platform certificates");
    }

    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "Loaded platform trust store");
    roots
}

/// Append the bundled Mozilla root set
pub fn add_bundled_roots(roots: &mut RootCertStore) {
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
}

/// Client config that verifies against `roots`
pub fn client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    ensure_crypto_provider();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Client config that accepts any certificate and sends no SNI.
///
/// Handshake signatures are still checked, only the chain is not.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    ensure_crypto_provider();
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(AcceptAnyCertificate::new())
        .with_no_client_auth();
    config.enable_sni = false;
    Arc::new(config)
}

/// Run a TLS client handshake over `stream` under `ctx`
pub async fn handshake(
    ctx: &OpContext,
    config: Arc<ClientConfig>,
    server_name: &str,
    stream: BoxedStream,
) -> Result<TlsStream<BoxedStream>, DialError> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
        DialError::Tls(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server name {:?}: {}", server_name, e),
        ))
    })?;

    let connector = TlsConnector::from(config);
    ctx.run(connector.connect(name, stream))
        .await?
        .map_err(DialError::Tls)
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCertificate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config_disables_sni() {
        let config = insecure_client_config();
        assert!(!config.enable_sni);
    }

    #[test]
    fn test_bundled_roots_are_not_empty() {
        let mut roots = RootCertStore::empty();
        add_bundled_roots(&mut roots);
        assert!(!roots.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_server_name() {
        let (client, _server) = tokio::io::duplex(1024);
        let result = handshake(
            &OpContext::background(),
            insecure_client_config(),
            "not a hostname",
            Box::new(client),
        )
        .await;
        assert!(matches!(result, Err(DialError::Tls(_))));
    }
}
