//! Bidirectional byte relay for CONNECT tunnels

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copy bytes both ways until either side closes or fails.
///
/// Each direction runs in its own task. The first direction to finish cancels
/// the other, and both streams are dropped before this returns.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let done = CancellationToken::new();

    let outbound = tokio::spawn(pipe(
        client_read,
        upstream_write,
        done.clone(),
        "client->upstream",
    ));
    let inbound = tokio::spawn(pipe(
        upstream_read,
        client_write,
        done.clone(),
        "upstream->client",
    ));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    RelayStats {
        client_to_upstream: outbound.unwrap_or(0),
        upstream_to_client: inbound.unwrap_or(0),
    }
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    done: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let read = tokio::select! {
            _ = done.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!(direction, error = %e, "Relay read failed");
                break;
            }
        };

        let write = tokio::select! {
            _ = done.cancelled() => break,
            write = writer.write_all(&buf[..n]) => write,
        };
        if let Err(e) = write {
            trace!(direction, error = %e, "Relay write failed");
            break;
        }
        copied += n as u64;
    }

    let _ = writer.shutdown().await;
    done.cancel();
    copied
}
