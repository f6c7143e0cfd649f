//! Bidirectional relay
//!
//! Pumps bytes between a downstream client transport and an upstream
//! transport until both directions have finished. Each direction owns one
//! fixed buffer and keeps a single read and a single write in flight, so
//! backpressure falls out of the loop structure: reading stalls whenever
//! the opposite peer cannot drain.

use crate::transport::Transport;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

/// Relay buffer size per direction
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Run the relay until both directions are done.
///
/// A direction ends on EOF or on any read or write error; it then shuts
/// down the write side it owns, which half-closes toward that peer and lets
/// the opposite direction drain to its natural EOF. Both transports are
/// released (and with them the sockets) only after both directions exit.
pub async fn relay(client: Transport, upstream: Transport) {
    let client_id = client.id();
    let upstream_id = upstream.id();

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (to_upstream, to_client) = tokio::join!(
        pipe(client_read, upstream_write),
        pipe(upstream_read, client_write),
    );

    match to_upstream {
        Ok(bytes) => debug!("[{:x}->{:x}] relay finished, {} bytes", client_id, upstream_id, bytes),
        Err(e) => debug!("[{:x}->{:x}] relay error: {}", client_id, upstream_id, e),
    }
    match to_client {
        Ok(bytes) => debug!("[{:x}->{:x}] relay finished, {} bytes", upstream_id, client_id, bytes),
        Err(e) => debug!("[{:x}->{:x}] relay error: {}", upstream_id, client_id, e),
    }
}

async fn pipe(
    mut reader: ReadHalf<Transport>,
    mut writer: WriteHalf<Transport>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        total += n as u64;
    };

    // Half-close toward the write-side peer; for TLS this sends close_notify
    let _ = writer.shutdown().await;

    result.map(|_| total)
}
