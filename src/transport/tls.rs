//! TLS transport
//!
//! Layered on the TCP transport using rustls. Accepting performs the
//! server-side handshake before the connection is handed out; connecting
//! dials TCP first and then runs the client-side handshake. All TLS
//! parameters live in immutable configs produced by a single-shot builder.

use super::{AcceptError, Transport, TransportAcceptor, TransportFactory};
use crate::config::TlsConfig;
use crate::transport::tcp::TcpTransportFactory;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Builder for [`TlsTransportFactory`]
///
/// Collects certificate material and verification settings, then yields the
/// factory. `build` consumes the builder, so it cannot be built twice.
#[derive(Debug, Default)]
pub struct TlsTransportFactoryBuilder {
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    cert_chain_file: Option<PathBuf>,
    private_key_file: Option<PathBuf>,
    verify_peer: bool,
    verify_host: Option<String>,
}

impl TlsTransportFactoryBuilder {
    /// Empty builder: no certificate material, peer verification off.
    pub fn new() -> Self {
        TlsTransportFactoryBuilder::default()
    }

    /// Builder populated from a configuration block.
    pub fn from_config(config: &TlsConfig) -> Self {
        if config.dh_param.is_some() {
            warn!("dh_param is not supported with rustls, ignoring");
        }
        if config.verify_depth.is_some() {
            warn!("verify_depth is not supported with rustls, ignoring");
        }
        TlsTransportFactoryBuilder {
            ca_file: config.ca.clone(),
            cert_file: config.cert.clone(),
            cert_chain_file: config.cert_chain.clone(),
            private_key_file: config.private_key.clone(),
            verify_peer: config.verify_peer,
            verify_host: config.verify_host.clone(),
        }
    }

    /// Trust the CA certificates in a PEM file instead of the native roots.
    pub fn load_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Use a single PEM certificate as the local certificate.
    pub fn load_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    /// Use a PEM certificate chain as the local certificate.
    pub fn load_cert_chain(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_chain_file = Some(path.into());
        self
    }

    /// Load the private key matching the local certificate.
    pub fn load_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    /// Require and verify the peer's certificate.
    ///
    /// On the accepting side this demands a client certificate signed by the
    /// trusted CA; on the connecting side it enables server certificate
    /// verification (off by default).
    pub fn set_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Verify the server certificate against this name when connecting.
    pub fn set_verify_host(mut self, host: impl Into<String>) -> Self {
        self.verify_host = Some(host.into());
        self
    }

    /// Build the factory, consuming the builder.
    pub fn build(self) -> Result<TlsTransportFactory> {
        let roots = self.root_store()?;

        let identity = match (&self.cert_chain_file, &self.cert_file) {
            (Some(path), _) | (None, Some(path)) => match &self.private_key_file {
                Some(key_path) => Some((load_certs(path)?, load_private_key(key_path)?)),
                None => bail!("TLS certificate given without a private key"),
            },
            (None, None) => None,
        };

        let client_config = {
            let builder = ClientConfig::builder();
            let builder = if self.verify_peer {
                builder.with_root_certificates(roots.clone())
            } else {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
            };
            match &identity {
                Some((certs, key)) => builder
                    .with_client_auth_cert(certs.clone(), key.clone_key())
                    .with_context(|| "invalid client certificate or key")?,
                None => builder.with_no_client_auth(),
            }
        };

        let acceptor = match identity {
            Some((certs, key)) => {
                let builder = if self.verify_peer {
                    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                        .build()
                        .with_context(|| "failed to build client certificate verifier")?;
                    ServerConfig::builder().with_client_cert_verifier(verifier)
                } else {
                    ServerConfig::builder().with_no_client_auth()
                };
                let config = builder
                    .with_single_cert(certs, key)
                    .with_context(|| "invalid server certificate or key")?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        let server_name = match self.verify_host {
            Some(host) => Some(
                ServerName::try_from(host.clone())
                    .with_context(|| format!("invalid verify_host: {host}"))?,
            ),
            None => None,
        };

        Ok(TlsTransportFactory {
            tcp: TcpTransportFactory::new(),
            acceptor,
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .with_context(|| "failed to add CA certificate to store")?;
                }
            }
            None => {
                let native_certs = rustls_native_certs::load_native_certs();
                for cert in native_certs.certs {
                    roots.add(cert).ok();
                }
            }
        }
        Ok(roots)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("failed to open certificate file: {path:?}"))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {path:?}"))?;
    if certs.is_empty() {
        bail!("no certificates found in {path:?}");
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("failed to open private key file: {path:?}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key from {path:?}"))?
        .with_context(|| format!("no private key found in {path:?}"))
}

/// Transport factory for TLS-over-TCP connections
pub struct TlsTransportFactory {
    tcp: TcpTransportFactory,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl std::fmt::Debug for TlsTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransportFactory")
            .field("server_name", &self.server_name)
            .field("can_accept", &self.acceptor.is_some())
            .finish()
    }
}

#[async_trait]
impl TransportFactory for TlsTransportFactory {
    async fn bind(&self, endpoint: SocketAddr) -> Result<Box<dyn TransportAcceptor>> {
        let tls = self
            .acceptor
            .clone()
            .with_context(|| "TLS listener requires a certificate and private key")?;
        let listener = self.tcp.listen(endpoint)?;
        Ok(Box::new(TlsTransportAcceptor {
            listener,
            tls,
            tcp: self.tcp.clone(),
        }))
    }

    async fn connect(&self, endpoint: SocketAddr) -> Result<Transport> {
        let stream = self
            .tcp
            .dial(endpoint)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;

        let server_name = match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::try_from(endpoint.ip().to_string())
                .with_context(|| "invalid server name")?,
        };

        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {endpoint} failed"))?;
        let transport = Transport::new(Box::new(tls_stream), local, peer);
        debug!("[{:x}] TLS connection established to {}", transport.id(), peer);
        Ok(transport)
    }
}

struct TlsTransportAcceptor {
    listener: TcpListener,
    tls: TlsAcceptor,
    tcp: TcpTransportFactory,
}

#[async_trait]
impl TransportAcceptor for TlsTransportAcceptor {
    fn local_endpoint(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn accept(&mut self) -> Result<Transport, AcceptError> {
        let (stream, peer) = self.listener.accept().await.map_err(AcceptError::Listener)?;
        self.tcp.apply_opts(&stream);
        let local = stream
            .local_addr()
            .map_err(|e| AcceptError::Connection(e.into()))?;

        // A failed handshake only loses this connection, never the listener
        let tls_stream = self.tls.accept(stream).await.map_err(|e| {
            AcceptError::Connection(
                anyhow::Error::new(e).context(format!("TLS handshake with {peer} failed")),
            )
        })?;

        let transport = Transport::new(Box::new(tls_stream), local, peer);
        debug!(
            "[{:x}] TLS handshake succeeded, remote endpoint {}",
            transport.id(),
            peer
        );
        Ok(transport)
    }
}

/// Certificate verifier that accepts any server certificate.
///
/// Installed when peer verification is disabled, mirroring an unverified
/// TLS client. Never used when `verify_peer` is set.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_path(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/certs")
            .join(name)
    }

    fn server_factory() -> TlsTransportFactory {
        TlsTransportFactoryBuilder::new()
            .load_cert_chain(cert_path("server.pem"))
            .load_private_key(cert_path("server-key.pem"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_without_key_fails() {
        let result = TlsTransportFactoryBuilder::new()
            .load_cert_chain(cert_path("server.pem"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_missing_file_fails() {
        let result = TlsTransportFactoryBuilder::new()
            .load_cert_chain(cert_path("no-such-cert.pem"))
            .load_private_key(cert_path("no-such-key.pem"))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_without_certificate_fails() {
        let factory = TlsTransportFactoryBuilder::new().build().unwrap();
        let result = factory.bind("127.0.0.1:0".parse().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let server = server_factory();
        let mut acceptor = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();

        // Client side verifies against the test CA
        let client = TlsTransportFactoryBuilder::new()
            .load_ca_file(cert_path("ca.pem"))
            .set_verify_peer(true)
            .set_verify_host("localhost")
            .build()
            .unwrap();

        let (connected, accepted) = tokio::join!(client.connect(endpoint), acceptor.accept());
        let mut connected = connected.unwrap();
        let mut accepted = accepted.unwrap();

        connected.write_all(b"over tls").await.unwrap();
        let mut buf = [0u8; 8];
        accepted.read(&mut buf, false).await.unwrap();
        assert_eq!(&buf, b"over tls");

        connected.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unverified_client_connects() {
        let server = server_factory();
        let mut acceptor = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();

        // verify_peer defaults to off, so no CA is needed
        let client = TlsTransportFactoryBuilder::new().build().unwrap();

        let (connected, accepted) = tokio::join!(client.connect(endpoint), acceptor.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_plain_client_fails_handshake_listener_survives() {
        let server = server_factory();
        let mut acceptor = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();

        let plain = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = tokio::net::TcpStream::connect(endpoint).await.unwrap();
            // Not a TLS record; the server-side handshake must fail
            stream.write_all(b"\x05\x01\x00").await.ok();
        });

        let result = acceptor.accept().await;
        assert!(matches!(result, Err(AcceptError::Connection(_))));
        plain.await.unwrap();

        // The listener is still usable afterwards
        let client = TlsTransportFactoryBuilder::new().build().unwrap();
        let (connected, accepted) = tokio::join!(client.connect(endpoint), acceptor.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }
}
