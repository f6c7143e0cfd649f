//! Transport layer
//!
//! A [`Transport`] is an established, uniquely owned byte stream with peer
//! metadata, produced by a [`TransportFactory`] either by accepting on an
//! endpoint or by connecting to one. Plain TCP and TLS-over-TCP yield the
//! same type, so the SOCKS machinery above never cares which one it holds.

mod tcp;
mod tls;

pub use tcp::TcpTransportFactory;
pub use tls::{TlsTransportFactory, TlsTransportFactoryBuilder};

use crate::socks::Address;
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Byte stream a [`Transport`] wraps
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

fn next_transport_id() -> u64 {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Socket options applied to every accepted and connected TCP socket
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply the options to a TCP stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// An established connection
///
/// Owns the underlying stream. At most one read and one write may be in
/// flight at a time; callers that need concurrent directions split it with
/// [`tokio::io::split`]. The id is process-unique and appears in log lines
/// so handshake and relay events of one connection can be correlated.
pub struct Transport {
    stream: Box<dyn TransportStream>,
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reported_local: Option<Address>,
    closed: bool,
}

impl Transport {
    /// Wrap an established stream together with its endpoint addresses.
    pub fn new(stream: Box<dyn TransportStream>, local: SocketAddr, peer: SocketAddr) -> Self {
        Transport {
            stream,
            id: next_transport_id(),
            local_addr: local,
            peer_addr: peer,
            reported_local: None,
            closed: false,
        }
    }

    /// Unique id for log correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The address this transport is bound to on the far side.
    ///
    /// Normally the local socket address; a SOCKS upstream overrides it with
    /// the bound address the next hop reported, so the downstream response
    /// can pass that on honestly.
    pub fn local_address(&self) -> Address {
        match &self.reported_local {
            Some(addr) => addr.clone(),
            None => Address::Ip(self.local_addr),
        }
    }

    /// The peer's address.
    pub fn remote_address(&self) -> Address {
        Address::Ip(self.peer_addr)
    }

    /// Replace the reported local address.
    pub fn set_reported_local(&mut self, addr: Address) {
        self.reported_local = Some(addr);
    }

    /// Read into `buf`.
    ///
    /// With `allow_short` the call completes as soon as at least one byte is
    /// available (zero means EOF); without it the buffer is filled entirely
    /// or the call fails, EOF included.
    pub async fn read(&mut self, buf: &mut [u8], allow_short: bool) -> io::Result<usize> {
        if allow_short {
            AsyncReadExt::read(self, buf).await
        } else {
            AsyncReadExt::read_exact(self, buf).await
        }
    }

    /// Write the whole buffer and flush it to the stream.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await?;
        AsyncWriteExt::flush(self).await
    }

    /// Close the transport.
    ///
    /// Shuts the write side down first (for TLS this sends `close_notify`
    /// before the socket can be dropped), then marks the transport closed.
    /// Closing twice is a no-op; reads and writes after close fail.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = AsyncWriteExt::shutdown(self).await;
        self.closed = true;
        result
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Errors out of [`TransportAcceptor::accept`]
///
/// A connection error leaves the acceptor usable (a failed TLS handshake
/// must not take the listener down); a listener error means accepting cannot
/// continue.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listening socket itself failed
    #[error("listener error: {0}")]
    Listener(io::Error),
    /// One connection failed during setup
    #[error("{0:#}")]
    Connection(anyhow::Error),
}

/// Produces transports by accepting on or connecting to endpoints
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Bind a listening socket at `endpoint` and return its acceptor.
    async fn bind(&self, endpoint: SocketAddr) -> Result<Box<dyn TransportAcceptor>>;

    /// Connect to `endpoint` and return the established transport.
    async fn connect(&self, endpoint: SocketAddr) -> Result<Transport>;
}

/// Accepts connections on a bound endpoint, one at a time
#[async_trait]
pub trait TransportAcceptor: Send {
    /// The endpoint the listener is bound to.
    fn local_endpoint(&self) -> io::Result<SocketAddr>;

    /// Wait for the next fully established connection.
    ///
    /// For TLS this includes the server-side handshake; the transport is
    /// only returned once the handshake succeeded.
    async fn accept(&mut self) -> Result<Transport, AcceptError>;
}
