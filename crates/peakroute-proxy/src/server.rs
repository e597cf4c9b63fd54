//! Local HTTP proxy server

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use peakroute_dialer::{join_host_port, DialError, Dialer, Network, OpContext};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::relay::relay;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HOP_BY_HOP_PROXY_HEADERS: [&str; 2] = ["proxy-authorization", "proxy-connection"];

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline for establishing each upstream connection
    pub dial_timeout: Duration,
}

impl ProxyServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            dial_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

/// Accepts proxy clients and serves them through `dialer`
pub struct ProxyServer {
    config: ProxyServerConfig,
    dialer: Arc<dyn Dialer>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop accepting when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, ServerError> {
        let bind_addr = self.config.bind_addr;

        for attempt in 1..=3 {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Successfully bound to {} on attempt {}/3", bind_addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Address {} is in use (attempt {}/3), retrying in 1 second...",
                        bind_addr, attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ServerError::Bind {
                        address: bind_addr.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ServerError::Bind {
            address: bind_addr.to_string(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = self.bind_with_retry().await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        info!("Proxy server listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted client connection");
                    let handler = Arc::new(RequestHandler {
                        dialer: self.dialer.clone(),
                        dial_timeout: self.config.dial_timeout,
                        shutdown: self.shutdown.clone(),
                        peer,
                    });
                    tokio::spawn(serve_connection(stream, handler));
                }
                Err(e) => {
                    // transient (e.g. EMFILE); keep the listener alive
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        info!("Proxy server on {} stopped", local_addr);
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, handler: Arc<RequestHandler>) {
    let peer = handler.peer;
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, error = %e, "Client connection ended with error");
    }
}

struct RequestHandler {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    shutdown: CancellationToken,
    peer: SocketAddr,
}

impl RequestHandler {
    fn dial_context(&self) -> OpContext {
        OpContext::from_token(self.shutdown.child_token()).timeout(self.dial_timeout)
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_forward(req).await
        }
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let target = match req.uri().authority() {
            Some(authority) if authority.port_u16().is_some() => authority.to_string(),
            _ => {
                warn!(peer = %self.peer, uri = %req.uri(), "CONNECT without host:port");
                return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
            }
        };

        let upstream = match self
            .dialer
            .dial(&self.dial_context(), Network::Tcp, &target)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %self.peer, target = %target, error = %e, "Upstream CONNECT failed");
                return error_response(status_for(&e), &e.to_string());
            }
        };

        let peer = self.peer;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    info!(peer = %peer, target = %target, "Tunnel established");
                    let stats = relay(TokioIo::new(upgraded), upstream).await;
                    info!(
                        peer = %peer,
                        target = %target,
                        sent = stats.client_to_upstream,
                        received = stats.upstream_to_client,
                        "Tunnel closed"
                    );
                }
                Err(e) => warn!(peer = %peer, target = %target, error = %e, "Client upgrade failed"),
            }
        });

        let mut response = Response::new(empty());
        response.extensions_mut().insert(hyper::ext::ReasonPhrase::from_static(
            b"Connection Established",
        ));
        response
    }

    async fn handle_forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let uri = req.uri().clone();
        let host = match (uri.scheme_str(), uri.host()) {
            (Some("http"), Some(host)) => host.to_string(),
            _ => {
                warn!(peer = %self.peer, uri = %uri, "Rejecting non-proxy request");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "expected an absolute http:// URI or CONNECT",
                );
            }
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let target = join_host_port(host, uri.port_u16().unwrap_or(80));

        let stream = match self
            .dialer
            .dial(&self.dial_context(), Network::Tcp, &target)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %self.peer, target = %target, error = %e, "Upstream dial failed");
                return error_response(status_for(&e), &e.to_string());
            }
        };

        let (mut sender, conn) = match hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                warn!(peer = %self.peer, target = %target, error = %e, "Upstream handshake failed");
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Upstream connection closed with error");
            }
        });

        let method = req.method().clone();
        let request = match to_origin_form(req) {
            Ok(request) => request,
            Err(e) => {
                error!(peer = %self.peer, error = %e, "Failed to rewrite request");
                return error_response(StatusCode::BAD_REQUEST, &e.to_string());
            }
        };

        match sender.send_request(request).await {
            Ok(response) => {
                info!(
                    peer = %self.peer,
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    "Forwarded request"
                );
                response.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(peer = %self.peer, uri = %uri, error = %e, "Forwarding failed");
                error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }
}

/// Rewrite an absolute-form proxy request into origin-form for the target
fn to_origin_form<B>(req: Request<B>) -> Result<Request<B>, http::Error> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            parts
                .headers
                .insert(HOST, HeaderValue::from_str(authority.as_str())?);
        }
    }
    for name in HOP_BY_HOP_PROXY_HEADERS {
        parts.headers.remove(name);
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = Uri::try_from(path)?;

    Ok(Request::from_parts(parts, body))
}

fn status_for(error: &DialError) -> StatusCode {
    match error {
        DialError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
