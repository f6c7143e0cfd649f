//! Test utilities shared across integration tests

#![allow(dead_code)]

use sockspan::error::ReplyCode;
use sockspan::socks::{
    Address, AuthMethodList, AuthMethodSelect, RequestPacket, ResponsePacket,
    SOCKS5_AUTH_METHOD_NONE,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::io::BufReader;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Path to a fixture under tests/certs.
pub fn cert_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/certs")
        .join(name)
}

/// Spawn an echo server that serves connections until the test ends.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn an echo server that echoes one read per connection and then
/// closes its end of the socket.
pub async fn spawn_one_shot_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
                // Dropping the stream closes the target side mid-relay
            });
        }
    });
    addr
}

/// Run the client side of the SOCKS5 handshake over any stream and return
/// the server's response.
pub async fn socks5_connect<S>(stream: &mut S, target: Address) -> ResponsePacket
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    AuthMethodList::no_auth().write_to(stream).await.unwrap();
    let select = AuthMethodSelect::read_from(stream).await.unwrap();
    assert_eq!(select.method, SOCKS5_AUTH_METHOD_NONE);

    RequestPacket::connect(target).write_to(stream).await.unwrap();
    ResponsePacket::read_from(stream).await.unwrap()
}

/// Handshake that is expected to succeed; returns the bound address.
pub async fn socks5_connect_ok<S>(stream: &mut S, target: Address) -> Address
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = socks5_connect(stream, target).await;
    assert_eq!(response.header.reply, ReplyCode::Succeeded);
    response.bound
}

/// Write a payload through an established SOCKS circuit and assert the far
/// end echoes it back byte-identically.
pub async fn assert_echo<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

/// TLS connector trusting the test CA.
pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let file = std::fs::File::open(cert_path("ca.pem")).unwrap();
    let mut reader = BufReader::new(file);
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS connection to `addr`, verifying it as "localhost".
pub async fn tls_connect(
    addr: SocketAddr,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let connector = tls_connector();
    let stream = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap()
}
