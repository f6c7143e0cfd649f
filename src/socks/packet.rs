//! SOCKS5 packet framing
//!
//! Typed packets for the negotiation phase, each readable from and writable
//! to any async byte stream. Request and response packets compose a
//! fixed-size header with an [`Address`] body; the header is validated
//! before any body byte is read.

use crate::error::{ReplyCode, SocksError};
use crate::socks::{Address, Command, SOCKS5_AUTH_METHOD_NONE, SOCKS5_RESERVED, SOCKS5_VERSION};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read and validate the version byte that leads every packet.
///
/// Exactly one byte is consumed, so a rejected stream is left positioned
/// right after the offending byte.
async fn read_version<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .await
        .with_context(|| "failed to read version byte")?;
    if version[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(version[0]).into());
    }
    Ok(())
}

async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Client greeting: `[VER][NMETHODS][METHODS...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMethodList {
    /// Offered authentication method bytes, 1..=255 entries
    pub methods: Vec<u8>,
}

impl AuthMethodList {
    /// Greeting offering only the no-authentication method.
    pub fn no_auth() -> Self {
        AuthMethodList {
            methods: vec![SOCKS5_AUTH_METHOD_NONE],
        }
    }

    /// Whether a method byte is among the offered ones.
    pub fn contains(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }

    /// Read a greeting; rejects a wrong version or an empty method list.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        read_version(reader).await?;
        let mut count = [0u8; 1];
        reader.read_exact(&mut count).await?;
        if count[0] == 0 {
            return Err(SocksError::NoAuthMethods.into());
        }
        let mut methods = vec![0u8; count[0] as usize];
        reader.read_exact(&mut methods).await?;
        Ok(AuthMethodList { methods })
    }

    /// Write the greeting.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(!self.methods.is_empty() && self.methods.len() <= 255);
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        write_bytes(writer, &buf).await
    }
}

/// Server method selection: `[VER][METHOD]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthMethodSelect {
    /// The method the server picked, or 0xFF for none
    pub method: u8,
}

impl AuthMethodSelect {
    /// Read a method selection.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        read_version(reader).await?;
        let mut method = [0u8; 1];
        reader.read_exact(&mut method).await?;
        Ok(AuthMethodSelect { method: method[0] })
    }

    /// Write the method selection.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_bytes(writer, &[SOCKS5_VERSION, self.method]).await
    }
}

/// Request header: `[VER][CMD][RSV]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Raw command byte; unknown values are answered, not dropped
    pub command: u8,
}

impl RequestHeader {
    /// Typed view of the command byte.
    pub fn command(&self) -> Option<Command> {
        Command::from_byte(self.command)
    }

    /// Read a request header. The RSV byte is consumed and ignored.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        read_version(reader).await?;
        let mut rest = [0u8; 2];
        reader.read_exact(&mut rest).await?;
        Ok(RequestHeader { command: rest[0] })
    }
}

/// Response header: `[VER][REP][RSV]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Reply code
    pub reply: ReplyCode,
}

impl ResponseHeader {
    /// Read a response header. The RSV byte is consumed and ignored.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        read_version(reader).await?;
        let mut rest = [0u8; 2];
        reader.read_exact(&mut rest).await?;
        let reply = ReplyCode::try_from(rest[0])?;
        Ok(ResponseHeader { reply })
    }
}

/// Full SOCKS5 request: header followed by the target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    /// Fixed-size header
    pub header: RequestHeader,
    /// Target the client wants to reach
    pub target: Address,
}

impl RequestPacket {
    /// CONNECT request for a target.
    pub fn connect(target: Address) -> Self {
        RequestPacket {
            header: RequestHeader {
                command: Command::Connect as u8,
            },
            target,
        }
    }

    /// Read header then body; a bad header short-circuits the body read.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let header = RequestHeader::read_from(reader).await?;
        let target = Address::read_from(reader).await?;
        Ok(RequestPacket { header, target })
    }

    /// Write header and body as one buffer.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(3 + self.target.serialized_len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.header.command);
        buf.push(SOCKS5_RESERVED);
        self.target.write_to_buf(&mut buf);
        write_bytes(writer, &buf).await
    }
}

/// Full SOCKS5 response: header followed by the bound address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    /// Fixed-size header
    pub header: ResponseHeader,
    /// Address the relay is bound to on the far side
    pub bound: Address,
}

impl ResponsePacket {
    /// Response with an explicit reply code and bound address.
    pub fn new(reply: ReplyCode, bound: Address) -> Self {
        ResponsePacket {
            header: ResponseHeader { reply },
            bound,
        }
    }

    /// Success response reporting the given bound address.
    pub fn success(bound: Address) -> Self {
        ResponsePacket::new(ReplyCode::Succeeded, bound)
    }

    /// Failure response; the bound address is all zeros.
    pub fn failure(reply: ReplyCode) -> Self {
        ResponsePacket::new(reply, Address::unspecified())
    }

    /// Read header then body; a bad header short-circuits the body read.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let header = ResponseHeader::read_from(reader).await?;
        let bound = Address::read_from(reader).await?;
        Ok(ResponsePacket { header, bound })
    }

    /// Write header and body as one buffer.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(3 + self.bound.serialized_len());
        buf.push(SOCKS5_VERSION);
        buf.push(u8::from(self.header.reply));
        buf.push(SOCKS5_RESERVED);
        self.bound.write_to_buf(&mut buf);
        write_bytes(writer, &buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::{SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, SOCKS5_AUTH_METHOD_PASSWORD};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_auth_method_list_roundtrip() {
        let packet = AuthMethodList {
            methods: vec![SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_PASSWORD],
        };
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x02, 0x00, 0x02]);

        let mut cursor = Cursor::new(buf);
        let parsed = AuthMethodList::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn test_auth_method_list_single_no_auth_accepted() {
        let mut cursor = Cursor::new(vec![0x05, 0x01, 0x00]);
        let parsed = AuthMethodList::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.methods, vec![SOCKS5_AUTH_METHOD_NONE]);
        assert!(parsed.contains(SOCKS5_AUTH_METHOD_NONE));
    }

    #[tokio::test]
    async fn test_auth_method_list_zero_methods_rejected() {
        let mut cursor = Cursor::new(vec![0x05, 0x00]);
        let err = AuthMethodList::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocksError>(),
            Some(SocksError::NoAuthMethods)
        ));
    }

    #[tokio::test]
    async fn test_bad_version_consumes_single_byte() {
        // 0x04 is SOCKS4; the parser must stop right after the version byte
        let mut cursor = Cursor::new(vec![0x04, 0x01, 0x00]);
        let err = AuthMethodList::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SocksError>(),
            Some(SocksError::UnsupportedVersion(0x04))
        ));
        assert_eq!(cursor.position(), 1);

        let mut cursor = Cursor::new(vec![0x00, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
        assert!(RequestPacket::read_from(&mut cursor).await.is_err());
        assert_eq!(cursor.position(), 1);

        let mut cursor = Cursor::new(vec![0xFF, 0x00]);
        assert!(AuthMethodSelect::read_from(&mut cursor).await.is_err());
        assert_eq!(cursor.position(), 1);
    }

    #[tokio::test]
    async fn test_auth_method_select_roundtrip() {
        let packet = AuthMethodSelect {
            method: SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        };
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0xFF]);

        let mut cursor = Cursor::new(buf);
        let parsed = AuthMethodSelect::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn test_request_packet_roundtrip_ipv4() {
        let packet = RequestPacket::connect(Address::Ip("127.0.0.1:7".parse().unwrap()));
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x07]);

        let mut cursor = Cursor::new(buf);
        let parsed = RequestPacket::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.header.command(), Some(Command::Connect));
    }

    #[tokio::test]
    async fn test_request_packet_roundtrip_domain() {
        let packet = RequestPacket::connect(Address::Domain("localhost".to_string(), 7));
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = RequestPacket::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn test_request_packet_unknown_command_parses() {
        // Unknown commands must parse so the server can answer them
        let mut bytes = vec![0x05, 0x09, 0x00];
        bytes.extend_from_slice(&Address::Ip("1.2.3.4:80".parse().unwrap()).to_bytes());
        let mut cursor = Cursor::new(bytes);
        let parsed = RequestPacket::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.header.command, 0x09);
        assert_eq!(parsed.header.command(), None);
    }

    #[tokio::test]
    async fn test_response_packet_roundtrip() {
        let packet = ResponsePacket::success(Address::Ip("10.1.2.3:4096".parse().unwrap()));
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = ResponsePacket::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.header.reply, ReplyCode::Succeeded);
    }

    #[tokio::test]
    async fn test_response_packet_failure_layout() {
        let packet = ResponsePacket::failure(ReplyCode::CommandNotSupported);
        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            vec![0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_response_packet_bad_reply_code() {
        let mut bytes = vec![0x05, 0x45, 0x00];
        bytes.extend_from_slice(&Address::unspecified().to_bytes());
        let mut cursor = Cursor::new(bytes);
        assert!(ResponsePacket::read_from(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_reserved_byte_ignored_on_receive() {
        // RSV is 0x7F instead of 0x00; the packet must still parse
        let mut bytes = vec![0x05, 0x01, 0x7F];
        bytes.extend_from_slice(&Address::Ip("1.2.3.4:80".parse().unwrap()).to_bytes());
        let mut cursor = Cursor::new(bytes);
        let parsed = RequestPacket::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.header.command(), Some(Command::Connect));
    }
}
