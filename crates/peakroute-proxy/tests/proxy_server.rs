//! ProxyServer end to end over the fake endpoint

mod common;

use async_trait::async_trait;
use common::*;
use peakroute_dialer::{BoxedStream, DialError, Dialer, Network, OpContext};
use peakroute_proxy::{EndpointSource, ProxyServer, ProxyServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn start_server(dialer: Arc<dyn Dialer>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let server = ProxyServer::new(
        ProxyServerConfig::new(addr).with_dial_timeout(Duration::from_secs(5)),
        dialer,
    )
    .with_shutdown(shutdown.clone());
    tokio::spawn(async move { server.serve(listener).await });

    (addr, shutdown)
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_until_contains(stream: &mut TcpStream, needle: &str) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if String::from_utf8_lossy(&collected).contains(needle) {
            break;
        }
    }
    String::from_utf8(collected).unwrap()
}

fn nl_upstream(network: &FakeEndpoint, pki: &TestPki) -> Arc<dyn Dialer> {
    Arc::new(upstream(
        EndpointSource::pinned(&nl_endpoint()).unwrap(),
        provider(&session("u", "p")),
        &pki.trust(),
        network,
    ))
}

#[tokio::test]
async fn test_connect_tunnel_relays_and_closes() {
    let pki = TestPki::new("nl1.example.com");
    let (network, mut closed) = FakeEndpoint::new(&pki, Origin::Echo);
    let (addr, _shutdown) = start_server(nl_upstream(&network, &pki)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "unexpected head: {}",
        head
    );

    client.write_all(b"hello tunnel").await.unwrap();
    let mut buf = [0u8; 12];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello tunnel");

    // the endpoint saw the nested CONNECT with SNI and credentials
    assert_eq!(network.dialed(), vec!["1.2.3.4:443"]);
    let observed = network.observed();
    assert_eq!(observed[0].sni.as_deref(), Some("nl1.example.com"));
    assert!(observed[0]
        .connect_head
        .starts_with("CONNECT example.org:443 HTTP/1.1\r\n"));
    assert!(observed[0]
        .connect_head
        .contains("Proxy-Authorization: Basic dTpw\r\n"));

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), closed.recv())
        .await
        .expect("upstream side should close after the client leaves")
        .unwrap();
}

#[tokio::test]
async fn test_plain_http_is_forwarded_in_origin_form() {
    let pki = TestPki::new("nl1.example.com");
    let (network, _closed) = FakeEndpoint::new(&pki, Origin::Http);
    let (addr, _shutdown) = start_server(nl_upstream(&network, &pki)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET http://example.org/index.html?x=1 HTTP/1.1\r\n\
              Host: example.org\r\n\
              Proxy-Authorization: Basic bG9jYWw6c2VjcmV0\r\n\
              Proxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        read_until_contains(&mut client, "hello"),
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("hello"));

    let observed = network.observed();
    assert_eq!(observed.len(), 1);
    assert!(observed[0]
        .connect_head
        .starts_with("CONNECT example.org:80 HTTP/1.1\r\n"));
    let origin = &observed[0].origin_head;
    assert!(origin.starts_with("GET /index.html?x=1 HTTP/1.1\r\n"), "{}", origin);
    assert!(origin.contains("Host: example.org\r\n"));
    assert!(!origin.contains("bG9jYWw6c2VjcmV0"));
    assert!(!origin.to_ascii_lowercase().contains("proxy-connection"));
}

#[tokio::test]
async fn test_origin_form_request_is_rejected() {
    let pki = TestPki::new("nl1.example.com");
    let (network, _closed) = FakeEndpoint::new(&pki, Origin::Http);
    let (addr, _shutdown) = start_server(nl_upstream(&network, &pki)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /not-a-proxy-request HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", head);
    assert!(network.dialed().is_empty());
}

/// Fails every dial with the given error
struct FailingDialer(fn() -> DialError);

#[async_trait]
impl Dialer for FailingDialer {
    async fn dial(
        &self,
        _ctx: &OpContext,
        _network: Network,
        _address: &str,
    ) -> Result<BoxedStream, DialError> {
        Err((self.0)())
    }
}

#[tokio::test]
async fn test_upstream_failures_map_to_gateway_errors() {
    let cases: [(fn() -> DialError, &str); 3] = [
        (|| DialError::ProxyAuthRequired, "502 Bad Gateway"),
        (|| DialError::ProxyRejected { status: 403 }, "502 Bad Gateway"),
        (|| DialError::Timeout, "504 Gateway Timeout"),
    ];

    for (make_error, expected) in cases {
        let (addr, _shutdown) = start_server(Arc::new(FailingDialer(make_error))).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
            .await
            .unwrap();

        let head = read_response_head(&mut client).await;
        assert!(head.starts_with(&format!("HTTP/1.1 {}", expected)), "{}", head);
    }
}

#[tokio::test]
async fn test_failed_connection_does_not_affect_others() {
    let pki = TestPki::new("nl1.example.com");
    let (network, _closed) = FakeEndpoint::new(&pki, Origin::Echo);
    let (addr, _shutdown) = start_server(nl_upstream(&network, &pki)).await;

    // garbage on one connection
    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(b"\x00\x01\x02 not http\r\n\r\n").await.unwrap();

    let mut good = TcpStream::connect(addr).await.unwrap();
    good.write_all(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n")
        .await
        .unwrap();
    let head = read_response_head(&mut good).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    good.write_all(b"still ok").await.unwrap();
    let mut buf = [0u8; 8];
    good.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still ok");
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let pki = TestPki::new("nl1.example.com");
    let (network, _closed) = FakeEndpoint::new(&pki, Origin::Echo);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(ProxyServerConfig::new(addr), nl_upstream(&network, &pki))
        .with_shutdown(shutdown.clone());
    let handle = tokio::spawn(async move { server.serve(listener).await });

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
