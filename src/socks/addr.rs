//! SOCKS5 address codec
//!
//! An address on the wire is `[ATYP(1)] [host(variable)] [port(2, BE)]`.
//! IPv4 hosts are 4 bytes, IPv6 hosts 16 bytes, domain names carry a one-byte
//! length prefix followed by 1..=255 bytes of name.

use crate::error::SocksError;
use crate::socks::{
    MAX_DOMAIN_LEN, SOCKS5_ADDR_TYPE_DOMAIN, SOCKS5_ADDR_TYPE_IPV4, SOCKS5_ADDR_TYPE_IPV6,
};
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Target or bound address carried in SOCKS5 requests and responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Literal IPv4 or IPv6 socket address
    Ip(SocketAddr),
    /// Domain name to be resolved by whoever dials it, plus port
    Domain(String, u16),
}

impl Address {
    /// The all-zero IPv4 address, used in failure replies.
    pub fn unspecified() -> Self {
        Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Port number of the address.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// The ATYP tag this address serializes with.
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ip(SocketAddr::V4(_)) => SOCKS5_ADDR_TYPE_IPV4,
            Address::Ip(SocketAddr::V6(_)) => SOCKS5_ADDR_TYPE_IPV6,
            Address::Domain(..) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Number of bytes the serialized form occupies.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Read an address from the stream.
    ///
    /// Two-phase: the ATYP byte decides whether a fixed-size host or a
    /// length-prefixed domain follows, then two bytes of big-endian port.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        reader
            .read_exact(&mut atyp)
            .await
            .with_context(|| "failed to read address type")?;

        match atyp[0] {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let mut host = [0u8; 4];
                reader.read_exact(&mut host).await?;
                let port = read_port(reader).await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(host)),
                    port,
                )))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                if len[0] == 0 {
                    return Err(SocksError::EmptyDomain.into());
                }
                let mut domain = vec![0u8; len[0] as usize];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|e| SocksError::Malformed(format!("invalid domain name: {e}")))?;
                let port = read_port(reader).await?;
                Ok(Address::Domain(domain, port))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                let mut host = [0u8; 16];
                reader.read_exact(&mut host).await?;
                let port = read_port(reader).await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(host)),
                    port,
                )))
            }
            other => Err(SocksError::AddressTypeNotSupported(other).into()),
        }
    }

    /// Append the serialized form to a buffer.
    pub fn write_to_buf(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.push(SOCKS5_ADDR_TYPE_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.push(SOCKS5_ADDR_TYPE_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(domain, port) => {
                debug_assert!(!domain.is_empty() && domain.len() <= MAX_DOMAIN_LEN);
                buf.push(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Serialized wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        buf
    }
}

async fn read_port<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut port = [0u8; 2];
    reader
        .read_exact(&mut port)
        .await
        .with_context(|| "failed to read port")?;
    Ok(u16::from_be_bytes(port))
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // SocketAddr renders as `a.b.c.d:port` or `[v6]:port`
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::SOCKS5_ADDR_TYPE_IPV4;
    use std::io::Cursor;

    async fn roundtrip(addr: &Address) -> Address {
        let bytes = addr.to_bytes();
        let mut cursor = Cursor::new(bytes);
        Address::read_from(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_ipv4() {
        let addr = Address::Ip("192.168.1.1:8080".parse().unwrap());
        assert_eq!(roundtrip(&addr).await, addr);
    }

    #[tokio::test]
    async fn test_roundtrip_ipv6() {
        let addr = Address::Ip("[2001:db8::1]:443".parse().unwrap());
        assert_eq!(roundtrip(&addr).await, addr);
    }

    #[tokio::test]
    async fn test_roundtrip_ipv6_unspecified_and_loopback() {
        let addr = Address::Ip("[::]:0".parse().unwrap());
        assert_eq!(roundtrip(&addr).await, addr);

        let addr = Address::Ip("[::1]:1080".parse().unwrap());
        assert_eq!(roundtrip(&addr).await, addr);
    }

    #[tokio::test]
    async fn test_roundtrip_domain() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert_eq!(roundtrip(&addr).await, addr);
    }

    #[tokio::test]
    async fn test_roundtrip_domain_length_boundaries() {
        let addr = Address::Domain("a".to_string(), 1);
        assert_eq!(roundtrip(&addr).await, addr);

        let addr = Address::Domain("x".repeat(255), 65535);
        assert_eq!(roundtrip(&addr).await, addr);
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let bytes = vec![SOCKS5_ADDR_TYPE_DOMAIN, 0, 0x00, 0x50];
        let mut cursor = Cursor::new(bytes);
        let err = Address::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocksError>(),
            Some(SocksError::EmptyDomain)
        ));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let bytes = vec![0x02, 1, 2, 3, 4, 0x00, 0x50];
        let mut cursor = Cursor::new(bytes);
        let err = Address::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocksError>(),
            Some(SocksError::AddressTypeNotSupported(0x02))
        ));
    }

    #[tokio::test]
    async fn test_wire_layout_ipv4() {
        let addr = Address::Ip("127.0.0.1:7".parse().unwrap());
        let bytes = addr.to_bytes();
        assert_eq!(bytes, vec![SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x00, 0x07]);
    }

    #[tokio::test]
    async fn test_wire_layout_domain() {
        let addr = Address::Domain("localhost".to_string(), 7);
        let bytes = addr.to_bytes();
        let mut expected = vec![SOCKS5_ADDR_TYPE_DOMAIN, 9];
        expected.extend_from_slice(b"localhost");
        expected.extend_from_slice(&[0x00, 0x07]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_serialized_len() {
        assert_eq!(
            Address::Ip("1.2.3.4:1".parse().unwrap()).serialized_len(),
            7
        );
        assert_eq!(Address::Ip("[::1]:1".parse().unwrap()).serialized_len(), 19);
        assert_eq!(
            Address::Domain("abc".to_string(), 1).serialized_len(),
            1 + 1 + 3 + 2
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Address::Ip("10.0.0.1:80".parse().unwrap()).to_string(),
            "10.0.0.1:80"
        );
        assert_eq!(
            Address::Ip("[::1]:80".parse().unwrap()).to_string(),
            "[::1]:80"
        );
        assert_eq!(
            Address::Domain("example.com".to_string(), 80).to_string(),
            "example.com:80"
        );
    }

    #[test]
    fn test_unspecified() {
        let addr = Address::unspecified();
        assert_eq!(addr.to_string(), "0.0.0.0:0");
        assert_eq!(addr.atyp(), SOCKS5_ADDR_TYPE_IPV4);
    }
}
