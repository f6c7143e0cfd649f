//! Plain TCP transport
//!
//! Listeners are bound with SO_REUSEADDR; every accepted and connected
//! socket gets TCP_NODELAY and keepalive applied.

use super::{AcceptError, SocketOpts, Transport, TransportAcceptor, TransportFactory};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Transport factory for plain TCP connections
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    socket_opts: SocketOpts,
}

impl TcpTransportFactory {
    /// Factory with default socket options.
    pub fn new() -> Self {
        TcpTransportFactory::default()
    }

    pub(crate) fn listen(&self, endpoint: SocketAddr) -> Result<TcpListener> {
        let socket = match endpoint {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .with_context(|| "failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .with_context(|| "failed to set SO_REUSEADDR")?;
        socket
            .bind(endpoint)
            .with_context(|| format!("failed to bind {endpoint}"))?;
        let listener = socket
            .listen(1024)
            .with_context(|| format!("failed to listen on {endpoint}"))?;
        Ok(listener)
    }

    pub(crate) async fn dial(&self, endpoint: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(endpoint).await?;
        self.apply_opts(&stream);
        Ok(stream)
    }

    pub(crate) fn apply_opts(&self, stream: &TcpStream) {
        if let Err(e) = self.socket_opts.apply(stream) {
            warn!("failed to apply socket options: {}", e);
        }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn bind(&self, endpoint: SocketAddr) -> Result<Box<dyn TransportAcceptor>> {
        let listener = self.listen(endpoint)?;
        Ok(Box::new(TcpAcceptor {
            listener,
            socket_opts: self.socket_opts.clone(),
        }))
    }

    async fn connect(&self, endpoint: SocketAddr) -> Result<Transport> {
        let stream = self
            .dial(endpoint)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let transport = Transport::new(Box::new(stream), local, peer);
        debug!("[{:x}] TCP connection established to {}", transport.id(), peer);
        Ok(transport)
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    socket_opts: SocketOpts,
}

#[async_trait]
impl TransportAcceptor for TcpAcceptor {
    fn local_endpoint(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn accept(&mut self) -> Result<Transport, AcceptError> {
        let (stream, peer) = self.listener.accept().await.map_err(AcceptError::Listener)?;
        if let Err(e) = self.socket_opts.apply(&stream) {
            warn!("failed to apply socket options: {}", e);
        }
        let local = stream
            .local_addr()
            .map_err(|e| AcceptError::Connection(e.into()))?;
        let transport = Transport::new(Box::new(stream), local, peer);
        debug!("[{:x}] accepted connection from {}", transport.id(), peer);
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let factory = TcpTransportFactory::new();
        // Grab a port and close it again so nothing is listening there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = factory.connect(addr).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let factory = TcpTransportFactory::new();
        let mut acceptor = factory
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();

        let (connected, accepted) =
            tokio::join!(factory.connect(endpoint), acceptor.accept());
        let mut connected = connected.unwrap();
        let mut accepted = accepted.unwrap();

        connected.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read(&mut buf, false).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(
            connected.local_address().to_string(),
            accepted.remote_address().to_string()
        );
    }

    #[tokio::test]
    async fn test_acceptor_survives_connection_churn() {
        let factory = TcpTransportFactory::new();
        let mut acceptor = factory
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();

        for _ in 0..3 {
            let (connected, accepted) =
                tokio::join!(factory.connect(endpoint), acceptor.accept());
            let mut connected = connected.unwrap();
            drop(accepted.unwrap());
            let _ = connected.close().await;
        }
    }
}
