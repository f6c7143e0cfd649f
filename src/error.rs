//! Error types for Sockspan
//!
//! Protocol-level failures are typed so that the downstream server can
//! translate them into SOCKS5 reply codes; everything else travels as
//! `anyhow::Error` with context attached.

use std::io;
use thiserror::Error;

/// SOCKS5 protocol errors
#[derive(Error, Debug)]
pub enum SocksError {
    /// Unsupported SOCKS version byte
    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Greeting carried zero authentication methods
    #[error("no authentication methods offered")]
    NoAuthMethods,

    /// None of the offered authentication methods is supported
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// The upstream selected a method this client never offered
    #[error("upstream selected an unsupported auth method: {0:#04x}")]
    UnsupportedAuthMethod(u8),

    /// Command other than CONNECT
    #[error("command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    /// Unknown address type tag
    #[error("address type not supported: {0:#04x}")]
    AddressTypeNotSupported(u8),

    /// Domain name of length zero
    #[error("empty domain name")]
    EmptyDomain,

    /// Structurally invalid packet
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A next-hop SOCKS server answered with a non-success reply
    #[error("upstream replied: {0}")]
    UpstreamReply(ReplyCode),
}

/// Reply codes for the SOCKS5 response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Human-readable RFC 1928 phrase.
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        }
    }

    /// Translate a request failure into the reply code sent downstream.
    ///
    /// Typed SOCKS errors map directly, including pass-through of the code a
    /// next-hop server answered with. I/O errors map by kind. Anything else
    /// is a general failure.
    pub fn for_error(err: &anyhow::Error) -> ReplyCode {
        if let Some(socks) = err.downcast_ref::<SocksError>() {
            return match socks {
                SocksError::CommandNotSupported(_) => ReplyCode::CommandNotSupported,
                SocksError::AddressTypeNotSupported(_) => ReplyCode::AddressTypeNotSupported,
                SocksError::UpstreamReply(code) => *code,
                _ => ReplyCode::GeneralFailure,
            };
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return ReplyCode::from(io_err);
        }
        ReplyCode::GeneralFailure
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = SocksError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ReplyCode::Succeeded),
            0x01 => Ok(ReplyCode::GeneralFailure),
            0x02 => Ok(ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(ReplyCode::NetworkUnreachable),
            0x04 => Ok(ReplyCode::HostUnreachable),
            0x05 => Ok(ReplyCode::ConnectionRefused),
            0x06 => Ok(ReplyCode::TtlExpired),
            0x07 => Ok(ReplyCode::CommandNotSupported),
            0x08 => Ok(ReplyCode::AddressTypeNotSupported),
            other => Err(SocksError::Malformed(format!(
                "unknown reply code: {other:#04x}"
            ))),
        }
    }
}

impl From<&io::Error> for ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            _ => ReplyCode::GeneralFailure,
        }
    }
}
