//! Upstream factories
//!
//! An upstream factory turns a target [`Address`] into a connected
//! [`Transport`] whose far end already speaks to that target, hiding whether
//! the path is a direct dial or a hop through another SOCKS5 server.

mod direct;
mod socks;

pub use direct::DirectUpstream;
pub use socks::SocksUpstream;

use crate::config::{UpstreamConfig, UpstreamProtocol};
use crate::socks::Address;
use crate::transport::{
    TcpTransportFactory, TlsTransportFactoryBuilder, Transport, TransportFactory,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Establishes connections to targets on behalf of the downstream server
#[async_trait]
pub trait UpstreamFactory: Send + Sync {
    /// Connect to `target`, directly or through the next hop.
    async fn request(&self, target: &Address) -> Result<Transport>;
}

/// Build the upstream factory an upstream config block describes.
///
/// The transport underneath is TLS when the block carries an `ssl` section,
/// plain TCP otherwise; direct and SOCKS upstreams share that choice.
pub fn from_config(config: &UpstreamConfig) -> Result<Arc<dyn UpstreamFactory>> {
    let transports: Arc<dyn TransportFactory> = match &config.ssl {
        Some(tls) => Arc::new(TlsTransportFactoryBuilder::from_config(tls).build()?),
        None => Arc::new(TcpTransportFactory::new()),
    };

    match config.protocol {
        UpstreamProtocol::Direct => Ok(Arc::new(DirectUpstream::new(transports))),
        UpstreamProtocol::Socks => {
            let host = config
                .address
                .clone()
                .with_context(|| "socks upstream requires an address")?;
            let port = config
                .port
                .with_context(|| "socks upstream requires a port")?;
            Ok(Arc::new(SocksUpstream::new(transports, host, port)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_direct() {
        let config = UpstreamConfig {
            protocol: UpstreamProtocol::Direct,
            address: None,
            port: None,
            ssl: None,
        };
        assert!(from_config(&config).is_ok());
    }

    #[test]
    fn test_from_config_socks_requires_endpoint() {
        let config = UpstreamConfig {
            protocol: UpstreamProtocol::Socks,
            address: None,
            port: None,
            ssl: None,
        };
        assert!(from_config(&config).is_err());

        let config = UpstreamConfig {
            protocol: UpstreamProtocol::Socks,
            address: Some("127.0.0.1".to_string()),
            port: Some(1080),
            ssl: None,
        };
        assert!(from_config(&config).is_ok());
    }
}
