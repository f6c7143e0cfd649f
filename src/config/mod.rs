//! Configuration for Sockspan
//!
//! A TOML file with a logging block and any number of `[[server]]` blocks,
//! each describing one listener, its optional TLS material, and the
//! upstream its traffic leaves through.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Listeners to run
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerConfig>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

/// Downstream protocol spoken on a listener
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerProtocol {
    /// SOCKS5
    #[default]
    #[serde(rename = "socks")]
    Socks,
}

/// One listener
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address, an IPv4 or IPv6 literal
    pub address: IpAddr,

    /// Bind port
    pub port: u16,

    /// Downstream protocol
    #[serde(default)]
    pub protocol: ServerProtocol,

    /// TLS for the downstream listener
    #[serde(default)]
    pub ssl: Option<TlsConfig>,

    /// Where accepted traffic goes
    pub upstream: UpstreamConfig,
}

/// Upstream protocol behind a listener
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    /// Dial targets directly
    #[serde(rename = "direct")]
    Direct,
    /// Relay through a next-hop SOCKS5 server
    #[serde(rename = "socks")]
    Socks,
}

/// Upstream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Upstream protocol
    pub protocol: UpstreamProtocol,

    /// Next-hop host, required for the socks protocol
    pub address: Option<String>,

    /// Next-hop port, required for the socks protocol
    pub port: Option<u16>,

    /// TLS for the upstream dial
    #[serde(default)]
    pub ssl: Option<TlsConfig>,
}

/// TLS material and verification settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Trusted CA certificate file (PEM); native roots when absent
    pub ca: Option<PathBuf>,

    /// Certificate chain file (PEM)
    pub cert_chain: Option<PathBuf>,

    /// Single certificate file (PEM), alternative to `cert_chain`
    pub cert: Option<PathBuf>,

    /// Private key file (PEM)
    pub private_key: Option<PathBuf>,

    /// DH parameter file; accepted for compatibility, ignored with rustls
    pub dh_param: Option<PathBuf>,

    /// Verification depth; accepted for compatibility, ignored with rustls
    pub verify_depth: Option<u32>,

    /// Require and verify the peer certificate
    #[serde(default)]
    pub verify_peer: bool,

    /// Expected server name when dialing out
    pub verify_host: Option<String>,
}

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
    parse_config(&content)
}

/// Parse configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "failed to parse configuration")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.servers.is_empty() {
        bail!("no [[server]] blocks configured");
    }
    for server in &config.servers {
        if let Some(tls) = &server.ssl {
            if tls.cert_chain.is_none() && tls.cert.is_none() {
                bail!(
                    "server {}:{} enables ssl but names no certificate",
                    server.address,
                    server.port
                );
            }
            if tls.private_key.is_none() {
                bail!(
                    "server {}:{} enables ssl but names no private key",
                    server.address,
                    server.port
                );
            }
        }
        if server.upstream.protocol == UpstreamProtocol::Socks
            && (server.upstream.address.is_none() || server.upstream.port.is_none())
        {
            bail!(
                "server {}:{} has a socks upstream without address/port",
                server.address,
                server.port
            );
        }
    }
    Ok(())
}
