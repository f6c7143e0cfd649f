//! SOCKS5 upstream
//!
//! Reaches targets through a next-hop SOCKS5 server. The hop's endpoint is
//! resolved lazily on the first request and remembered; each request then
//! runs the SOCKS5 client handshake over a fresh connection to it.

use super::UpstreamFactory;
use crate::error::{ReplyCode, SocksError};
use crate::socks::{
    Address, AuthMethodList, AuthMethodSelect, RequestPacket, ResponsePacket,
    SOCKS5_AUTH_METHOD_NONE,
};
use crate::transport::{Transport, TransportFactory};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Upstream that relays through another SOCKS5 server
pub struct SocksUpstream {
    transports: Arc<dyn TransportFactory>,
    host: String,
    port: u16,
    /// Resolved once, on the first request that gets here
    endpoint: OnceCell<SocketAddr>,
}

impl SocksUpstream {
    /// SOCKS upstream at `host:port`, dialed through the given factory.
    pub fn new(transports: Arc<dyn TransportFactory>, host: impl Into<String>, port: u16) -> Self {
        SocksUpstream {
            transports,
            host: host.into(),
            port,
            endpoint: OnceCell::new(),
        }
    }

    /// Connect to the next-hop server.
    ///
    /// The first call resolves the configured host and tries each resolver
    /// result until one connects, remembering the winner; concurrent first
    /// requests share a single resolution. Later calls dial the remembered
    /// endpoint directly.
    async fn connect_upstream(&self) -> Result<Transport> {
        if let Some(endpoint) = self.endpoint.get() {
            return self.transports.connect(*endpoint).await;
        }

        let mut first_connection = None;
        let endpoint = self
            .endpoint
            .get_or_try_init(|| async {
                debug!("resolving upstream address {}, port {}", self.host, self.port);
                let endpoints = lookup_host((self.host.as_str(), self.port))
                    .await
                    .map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::HostUnreachable,
                            format!("failed to resolve upstream {}: {e}", self.host),
                        )
                    })?;

                let mut last_error = None;
                for candidate in endpoints {
                    match self.transports.connect(candidate).await {
                        Ok(transport) => {
                            first_connection = Some(transport);
                            return Ok(candidate);
                        }
                        Err(e) => {
                            debug!("connect to upstream {} failed: {:#}", candidate, e);
                            last_error = Some(e);
                        }
                    }
                }

                Err(last_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("no addresses found for upstream {}", self.host),
                    )
                    .into()
                }))
            })
            .await?;

        match first_connection {
            Some(transport) => Ok(transport),
            None => self.transports.connect(*endpoint).await,
        }
    }

    /// Drive the SOCKS5 client handshake and return the bound address the
    /// next hop reported.
    async fn negotiate(&self, transport: &mut Transport, target: &Address) -> Result<Address> {
        let id = transport.id();

        debug!("[{:x}] sending auth method list", id);
        AuthMethodList::no_auth()
            .write_to(transport)
            .await
            .with_context(|| "failed to send auth method list")?;

        let select = AuthMethodSelect::read_from(transport)
            .await
            .with_context(|| "failed to read auth method selection")?;
        if select.method != SOCKS5_AUTH_METHOD_NONE {
            return Err(SocksError::UnsupportedAuthMethod(select.method).into());
        }

        debug!("[{:x}] sending connect request for {}", id, target);
        RequestPacket::connect(target.clone())
            .write_to(transport)
            .await
            .with_context(|| "failed to send connect request")?;

        let response = ResponsePacket::read_from(transport)
            .await
            .with_context(|| "failed to read connect response")?;
        if response.header.reply != ReplyCode::Succeeded {
            return Err(SocksError::UpstreamReply(response.header.reply).into());
        }

        Ok(response.bound)
    }
}

#[async_trait]
impl UpstreamFactory for SocksUpstream {
    async fn request(&self, target: &Address) -> Result<Transport> {
        info!("requesting {} via upstream {}:{}", target, self.host, self.port);

        let mut transport = self.connect_upstream().await?;
        match self.negotiate(&mut transport, target).await {
            Ok(bound) => {
                // The caller must see the bound address the hop reported,
                // not the local address of the socket to the hop
                transport.set_reported_local(bound);
                info!("[{:x}] connection to {} established", transport.id(), target);
                Ok(transport)
            }
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }
}
