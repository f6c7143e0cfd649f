//! Direct upstream
//!
//! Reaches the target by dialing it straight from this process. Domain
//! targets are resolved asynchronously and every resolver result is tried
//! in order until one connects.

use super::UpstreamFactory;
use crate::socks::Address;
use crate::transport::{Transport, TransportFactory};
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::lookup_host;
use tracing::{debug, info};

/// Upstream that connects to targets directly
pub struct DirectUpstream {
    transports: Arc<dyn TransportFactory>,
}

impl DirectUpstream {
    /// Direct upstream dialing through the given transport factory.
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        DirectUpstream { transports }
    }
}

#[async_trait]
impl UpstreamFactory for DirectUpstream {
    async fn request(&self, target: &Address) -> Result<Transport> {
        info!("direct request to {}", target);

        match target {
            Address::Ip(endpoint) => self.transports.connect(*endpoint).await,
            Address::Domain(host, port) => {
                debug!("resolving {}", host);
                let endpoints = lookup_host((host.as_str(), *port)).await.map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("failed to resolve {host}: {e}"),
                    )
                })?;

                let mut last_error = None;
                for endpoint in endpoints {
                    match self.transports.connect(endpoint).await {
                        Ok(transport) => return Ok(transport),
                        Err(e) => {
                            debug!("connect to {} failed: {:#}", endpoint, e);
                            last_error = Some(e);
                        }
                    }
                }

                Err(last_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("no addresses found for {host}"),
                    )
                    .into()
                }))
            }
        }
    }
}
