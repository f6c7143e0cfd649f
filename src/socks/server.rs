//! Downstream SOCKS5 server
//!
//! Owns a listening endpoint and, for every accepted transport, drives the
//! server side of the SOCKS5 negotiation: greeting, method selection,
//! request, upstream dispatch, response, then the relay phase. Each
//! connection runs on its own task; the accept loop never waits on one.

use crate::config::ServerConfig;
use crate::error::{ReplyCode, SocksError};
use crate::relay::relay;
use crate::socks::{
    Address, AuthMethodList, AuthMethodSelect, Command, RequestHeader, ResponsePacket,
    SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
};
use crate::transport::{
    AcceptError, TcpTransportFactory, TlsTransportFactoryBuilder, Transport, TransportAcceptor,
    TransportFactory,
};
use crate::upstream::{self, UpstreamFactory};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A SOCKS5 listener bound to one endpoint with one upstream behind it
pub struct SocksServer {
    endpoint: SocketAddr,
    transports: Arc<dyn TransportFactory>,
    upstream: Arc<dyn UpstreamFactory>,
}

impl SocksServer {
    /// Server accepting with `transports` on `endpoint`, dispatching
    /// requests to `upstream`.
    pub fn new(
        endpoint: SocketAddr,
        transports: Arc<dyn TransportFactory>,
        upstream: Arc<dyn UpstreamFactory>,
    ) -> Self {
        SocksServer {
            endpoint,
            transports,
            upstream,
        }
    }

    /// Assemble a server from one `[[server]]` config block.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let endpoint = SocketAddr::new(config.address, config.port);
        let transports: Arc<dyn TransportFactory> = match &config.ssl {
            Some(tls) => Arc::new(TlsTransportFactoryBuilder::from_config(tls).build()?),
            None => Arc::new(TcpTransportFactory::new()),
        };
        let upstream = upstream::from_config(&config.upstream)?;
        Ok(SocksServer::new(endpoint, transports, upstream))
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<Box<dyn TransportAcceptor>> {
        let acceptor = self
            .transports
            .bind(self.endpoint)
            .await
            .with_context(|| format!("failed to bind SOCKS server at {}", self.endpoint))?;
        info!("SOCKS server listening on {}", acceptor.local_endpoint()?);
        Ok(acceptor)
    }

    /// Accept connections until the listener fails.
    ///
    /// Per-connection setup errors (a failed TLS handshake, say) are logged
    /// and accepting continues; a listener error ends the loop.
    pub async fn serve(&self, mut acceptor: Box<dyn TransportAcceptor>) -> Result<()> {
        loop {
            match acceptor.accept().await {
                Ok(transport) => {
                    let upstream = Arc::clone(&self.upstream);
                    tokio::spawn(async move {
                        let id = transport.id();
                        if let Err(e) = serve_connection(transport, upstream).await {
                            debug!("[{:x}] connection ended: {:#}", id, e);
                        }
                    });
                }
                Err(AcceptError::Connection(e)) => {
                    debug!("dropping connection: {:#}", e);
                }
                Err(AcceptError::Listener(e)) => {
                    warn!("listener on {} failed: {}", self.endpoint, e);
                    return Err(e).with_context(|| "acceptor became unusable");
                }
            }
        }
    }

    /// Bind and serve.
    pub async fn run(&self) -> Result<()> {
        let acceptor = self.bind().await?;
        self.serve(acceptor).await
    }
}

/// Drive one downstream connection from greeting to relay.
async fn serve_connection(
    mut client: Transport,
    upstream: Arc<dyn UpstreamFactory>,
) -> Result<()> {
    let id = client.id();

    // Malformed greetings get no response, the connection just goes away
    let greeting = AuthMethodList::read_from(&mut client).await?;

    let method = if greeting.contains(SOCKS5_AUTH_METHOD_NONE) {
        SOCKS5_AUTH_METHOD_NONE
    } else {
        SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
    };
    AuthMethodSelect { method }.write_to(&mut client).await?;
    if method == SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
        let _ = client.close().await;
        return Err(SocksError::NoAcceptableMethod.into());
    }

    let header = RequestHeader::read_from(&mut client).await?;
    let target = match Address::read_from(&mut client).await {
        Ok(target) => target,
        Err(e) => {
            reject(&mut client, ReplyCode::for_error(&e)).await;
            return Err(e);
        }
    };

    if header.command() != Some(Command::Connect) {
        reject(&mut client, ReplyCode::CommandNotSupported).await;
        return Err(SocksError::CommandNotSupported(header.command).into());
    }

    info!("[{:x}] CONNECT request for {}", id, target);

    let upstream_transport = match upstream.request(&target).await {
        Ok(transport) => transport,
        Err(e) => {
            let code = ReplyCode::for_error(&e);
            debug!("[{:x}] upstream request for {} failed ({}): {:#}", id, target, code, e);
            reject(&mut client, code).await;
            return Err(e);
        }
    };

    let bound = upstream_transport.local_address();
    ResponsePacket::success(bound).write_to(&mut client).await?;

    debug!("[{:x}] relaying to {} via [{:x}]", id, target, upstream_transport.id());
    relay(client, upstream_transport).await;
    Ok(())
}

/// Send a failure response with an all-zero bound address, then close.
async fn reject(client: &mut Transport, code: ReplyCode) {
    let _ = ResponsePacket::failure(code).write_to(client).await;
    let _ = client.close().await;
}
