//! Shared fixtures: a throwaway PKI and an in-memory backend endpoint

#![allow(dead_code)]

use async_trait::async_trait;
use peakroute_api::{Credentials, Endpoint, ProxySession, SharedCell};
use peakroute_dialer::{BoxedStream, DialError, Dialer, Network, OpContext};
use peakroute_proxy::{EndpointSource, SessionProvider, TrustConfig, UpstreamDialer};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

pub struct TestPki {
    pub ca_der: CertificateDer<'static>,
    /// Intermediate between the CA and the leaf, when the chain has one
    pub intermediate_der: Option<CertificateDer<'static>>,
    pub acceptor: TlsAcceptor,
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, name);
    params
}

fn acceptor(chain: Vec<CertificateDer<'static>>, leaf_key: &KeyPair) -> TlsAcceptor {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

impl TestPki {
    /// A CA plus a leaf for `server_name`, served with the full chain
    pub fn new(server_name: &str) -> Self {
        peakroute_dialer::tls::ensure_crypto_provider();

        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params("peakroute test CA").self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![server_name.to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        Self {
            ca_der: ca_cert.der().clone(),
            intermediate_der: None,
            acceptor: acceptor(vec![leaf_cert.der().clone(), ca_cert.der().clone()], &leaf_key),
        }
    }

    /// CA -> intermediate -> leaf, where the server sends only the leaf
    pub fn leaf_only(server_name: &str) -> Self {
        peakroute_dialer::tls::ensure_crypto_provider();

        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params("peakroute test root").self_signed(&ca_key).unwrap();

        let mid_key = KeyPair::generate().unwrap();
        let mid_cert = ca_params("peakroute test intermediate")
            .signed_by(&mid_key, &ca_cert, &ca_key)
            .unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![server_name.to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &mid_cert, &mid_key).unwrap();

        Self {
            ca_der: ca_cert.der().clone(),
            intermediate_der: Some(mid_cert.der().clone()),
            acceptor: acceptor(vec![leaf_cert.der().clone()], &leaf_key),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        roots
    }

    pub fn trust(&self) -> TrustConfig {
        TrustConfig::new(true).with_ca_pool(self.roots())
    }
}

/// What the fake endpoint does once the CONNECT is accepted
#[derive(Clone, Copy, Debug)]
pub enum Origin {
    /// Echo tunnel bytes back
    Echo,
    /// Answer one HTTP request with `hello`
    Http,
}

#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub sni: Option<String>,
    pub connect_head: String,
    pub origin_head: String,
}

/// Base dialer whose every connection lands on an in-process TLS proxy
#[derive(Clone)]
pub struct FakeEndpoint {
    pub dialed: Arc<Mutex<Vec<String>>>,
    pub observed: Arc<Mutex<Vec<Observed>>>,
    acceptor: TlsAcceptor,
    origin: Origin,
    closed_tx: mpsc::UnboundedSender<()>,
}

impl FakeEndpoint {
    pub fn new(pki: &TestPki, origin: Origin) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        (
            Self {
                dialed: Arc::default(),
                observed: Arc::default(),
                acceptor: pki.acceptor.clone(),
                origin,
                closed_tx,
            },
            closed_rx,
        )
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).ok()
}

#[async_trait]
impl Dialer for FakeEndpoint {
    async fn dial(
        &self,
        _ctx: &OpContext,
        _network: Network,
        address: &str,
    ) -> Result<BoxedStream, DialError> {
        self.dialed.lock().unwrap().push(address.to_string());

        let (client, server) = tokio::io::duplex(64 * 1024);
        let acceptor = self.acceptor.clone();
        let observed = self.observed.clone();
        let origin = self.origin;
        let closed_tx = self.closed_tx.clone();

        tokio::spawn(async move {
            let Ok(mut tls) = acceptor.accept(server).await else {
                return;
            };
            let mut seen = Observed {
                sni: tls.get_ref().1.server_name().map(str::to_string),
                ..Observed::default()
            };

            let Some(head) = read_head(&mut tls).await else {
                return;
            };
            seen.connect_head = head;
            // recorded before answering so callers see it once the dial returns
            if let Origin::Echo = origin {
                observed.lock().unwrap().push(seen.clone());
            }
            tls.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();

            match origin {
                Origin::Echo => {
                    let mut buf = [0u8; 4096];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tls.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Origin::Http => {
                    seen.origin_head = read_head(&mut tls).await.unwrap_or_default();
                    observed.lock().unwrap().push(seen);
                    let _ = tls
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                        )
                        .await;
                    let _ = tls.shutdown().await;
                }
            }
            let _ = closed_tx.send(());
        });

        Ok(Box::new(client))
    }
}

pub fn nl_endpoint() -> Endpoint {
    Endpoint {
        host: "nl1.example.com".to_string(),
        port: 443,
        addresses: vec!["1.2.3.4".to_string()],
        protocol: "https".to_string(),
    }
}

/// Session cell seeded with the `nl` endpoint and `user:pass`
pub fn session(user: &str, pass: &str) -> Arc<SharedCell<ProxySession>> {
    Arc::new(SharedCell::new(ProxySession {
        endpoint: nl_endpoint(),
        credentials: Credentials::new(user, pass),
    }))
}

pub fn set_credentials(cell: &SharedCell<ProxySession>, user: &str, pass: &str) {
    cell.update(|current| ProxySession {
        endpoint: current.endpoint.clone(),
        credentials: Credentials::new(user, pass),
    });
}

pub fn provider(cell: &Arc<SharedCell<ProxySession>>) -> SessionProvider {
    let cell = cell.clone();
    Arc::new(move || (*cell.load()).clone())
}

pub fn upstream(
    source: EndpointSource,
    session: SessionProvider,
    trust: &TrustConfig,
    network: &FakeEndpoint,
) -> UpstreamDialer {
    UpstreamDialer::new(source, session, trust, Arc::new(network.clone())).unwrap()
}

pub fn ctx() -> OpContext {
    OpContext::with_timeout(Duration::from_secs(5))
}
