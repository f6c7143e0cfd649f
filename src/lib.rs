//! # Sockspan - SOCKS5 Proxy Relay
//!
//! Sockspan accepts SOCKS5 clients, over plain TCP or TLS, and relays each
//! connection's traffic to its target through a pluggable upstream: a direct
//! dial, or another SOCKS5 server that may itself sit behind TLS. Once both
//! sides are established the relay pipes bytes in both directions with
//! proper half-close semantics until the connection winds down.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockspan::config::load_config;
//! use sockspan::socks::SocksServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let server = SocksServer::from_config(&config.servers[0])?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 client -> SocksServer (TCP or TLS) -> UpstreamFactory -> target
//!                                               direct | socks5 (| TLS)
//! ```
//!
//! A `TransportFactory` yields `Transport`s by accepting or connecting, so
//! the protocol machinery is indifferent to TLS. The downstream server
//! negotiates with the client, asks its `UpstreamFactory` for a connected
//! transport to the target, reports the bound address back, and hands both
//! transports to the relay.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod relay;
pub mod socks;
pub mod transport;
pub mod upstream;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ReplyCode, SocksError};
pub use socks::{Address, SocksServer};
pub use transport::Transport;

/// Version of the Sockspan library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
