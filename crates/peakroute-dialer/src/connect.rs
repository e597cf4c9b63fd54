//! HTTP CONNECT negotiation over an already-open stream

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::context::OpContext;
use crate::error::DialError;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Ask the proxy at the other end of `stream` to open a tunnel to `target`.
///
/// `authorization` is sent verbatim as `Proxy-Authorization`. The response head
/// is consumed byte by byte so nothing past the blank line is swallowed.
pub async fn http_connect<S>(
    ctx: &OpContext,
    stream: &mut S,
    target: &str,
    authorization: Option<&str>,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    ctx.run(negotiate(stream, target, authorization)).await?
}

async fn negotiate<S>(
    stream: &mut S,
    target: &str,
    authorization: Option<&str>,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(value) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status = parse_status(&head)?;
    debug!(target = %target, status, "Proxy answered CONNECT");

    match status {
        200..=299 => Ok(()),
        407 => Err(DialError::ProxyAuthRequired),
        status => Err(DialError::ProxyRejected { status }),
    }
}

async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, DialError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::ProxyHandshake(
                "connection closed before CONNECT response".to_string(),
            ));
        }
        head.push(byte[0]);

        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(DialError::ProxyHandshake(
                "CONNECT response head too large".to_string(),
            ));
        }
    }
}

fn parse_status(head: &[u8]) -> Result<u16, DialError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response.code.ok_or_else(|| {
            DialError::ProxyHandshake("CONNECT response without status".to_string())
        }),
        Ok(httparse::Status::Partial) => Err(DialError::ProxyHandshake(
            "incomplete CONNECT response".to_string(),
        )),
        Err(e) => Err(DialError::ProxyHandshake(format!(
            "malformed CONNECT response: {}",
            e
        ))),
    }
}
