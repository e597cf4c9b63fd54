//! Trust anchors for the backend endpoint

use peakroute_dialer::tls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::TrustError;

static BUNDLED_INTERMEDIATES: &[u8] = include_bytes!("../certs/bundled-intermediates.pem");

/// Intermediates shipped with the binary for the chain workaround
pub fn bundled_intermediates() -> Vec<CertificateDer<'static>> {
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut &BUNDLED_INTERMEDIATES[..]) {
        match cert {
            Ok(cert) => certs.push(cert),
            Err(e) => warn!(error = %e, "Skipping unreadable bundled intermediate"),
        }
    }
    certs
}

/// How the endpoint certificate chain is validated.
///
/// A custom CA pool replaces everything else. Without one, the platform
/// store is used, and when `cert_chain_workaround` is on the bundled
/// cross-signed intermediates are offered to path building next to the
/// chain the server sent.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub cert_chain_workaround: bool,
    pub ca_pool: Option<RootCertStore>,
    default_roots: Option<RootCertStore>,
    intermediates: Vec<CertificateDer<'static>>,
}

impl TrustConfig {
    pub fn new(cert_chain_workaround: bool) -> Self {
        Self {
            cert_chain_workaround,
            ca_pool: None,
            default_roots: None,
            intermediates: bundled_intermediates(),
        }
    }

    pub fn with_ca_pool(mut self, pool: RootCertStore) -> Self {
        self.ca_pool = Some(pool);
        self
    }

    /// Use `roots` in place of the platform store
    pub fn with_default_roots(mut self, roots: RootCertStore) -> Self {
        self.default_roots = Some(roots);
        self
    }

    /// Replace the bundled intermediates
    pub fn with_intermediates(mut self, intermediates: Vec<CertificateDer<'static>>) -> Self {
        self.intermediates = intermediates;
        self
    }

    pub fn root_store(&self) -> RootCertStore {
        if let Some(pool) = &self.ca_pool {
            return pool.clone();
        }
        match &self.default_roots {
            Some(roots) => roots.clone(),
            None => tls::platform_roots(),
        }
    }

    /// Extra intermediates handed to the verifier; never used with a custom CA pool
    pub fn injected_intermediates(&self) -> &[CertificateDer<'static>] {
        if self.ca_pool.is_some() || !self.cert_chain_workaround {
            return &[];
        }
        &self.intermediates
    }

    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TrustError> {
        tls::ensure_crypto_provider();

        let roots = Arc::new(self.root_store());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let webpki = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider).build()?;

        let extra = self.injected_intermediates().to_vec();
        debug!(
            roots = roots.len(),
            intermediates = extra.len(),
            custom_ca = self.ca_pool.is_some(),
            "Built endpoint trust"
        );

        let verifier: Arc<dyn ServerCertVerifier> = if extra.is_empty() {
            webpki
        } else {
            Arc::new(WithIntermediates {
                inner: webpki,
                extra,
            })
        };

        Ok(Arc::new(
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth(),
        ))
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Full webpki verification with extra intermediates available for path building
#[derive(Debug)]
struct WithIntermediates {
    inner: Arc<WebPkiServerVerifier>,
    extra: Vec<CertificateDer<'static>>,
}

impl ServerCertVerifier for WithIntermediates {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = intermediates.to_vec();
        chain.extend(self.extra.iter().cloned());
        self.inner
            .verify_server_cert(end_entity, &chain, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Load every certificate from a PEM bundle
pub fn load_ca_file(path: &Path) -> Result<RootCertStore, TrustError> {
    let file = File::open(path).map_err(|source| TrustError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|source| TrustError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        roots.add(cert)?;
    }

    if roots.is_empty() {
        return Err(TrustError::NoCertificates(path.to_path_buf()));
    }
    Ok(roots)
}
