//! TCP and TLS connection setup for the proxy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{ChannelConnector, ProxyChannel, ProxyEndpoint};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::SignedTicket;

/// Byte stream a [`ProxyChannel`] can run over (plain TCP or TLS).
pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyIo for T {}

/// Connects [`ProxyChannel`]s over TCP, with TLS for `https://` proxy URLs.
#[derive(Clone)]
pub struct TlsProxyConnector {
    tls: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TlsProxyConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsProxyConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsProxyConnector {
    /// Trust only the CA certificates in a PEM bundle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the bundle holds no usable certificate.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut reader = std::io::BufReader::new(pem);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("Failed to parse CA bundle: {e}")))?;

        let mut roots = rustls::RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::Tls("CA bundle contains no usable certificates".to_string()));
        }
        if ignored > 0 {
            tracing::warn!("Ignored {ignored} unparsable certificates in CA bundle");
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::with_config(config))
    }

    /// Trust the CA certificates in the PEM file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no certificate.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .map_err(|e| Error::Tls(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_pem(&pem)
    }

    /// Accept any server certificate.
    ///
    /// For lab proxies with self-signed certificates only.
    #[must_use]
    pub fn insecure() -> Self {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier))
            .with_no_client_auth();
        Self::with_config(config)
    }

    /// Build from the control-plane trust settings and transfer timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if neither a CA file nor `insecure` is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let cp = &config.control_plane;
        let connector = match (&cp.ca_file, cp.insecure) {
            (_, true) => {
                tracing::warn!("Proxy certificate verification is disabled");
                Self::insecure()
            }
            (Some(path), false) => Self::from_pem_file(path)?,
            (None, false) => {
                return Err(Error::Config(
                    "control_plane.ca_file is required unless control_plane.insecure is set"
                        .to_string(),
                ))
            }
        };
        Ok(connector.with_connect_timeout(config.transfer.connect_timeout))
    }

    fn with_config(config: rustls::ClientConfig) -> Self {
        Self {
            tls: Arc::new(config),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Override the TCP connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open(&self, endpoint: &ProxyEndpoint) -> Result<Box<dyn ProxyIo>> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out after {}s connecting to {}:{}",
                    self.connect_timeout.as_secs(),
                    endpoint.host,
                    endpoint.port
                ))
            })?
            .map_err(|e| {
                Error::Connection(format!("{}:{}: {e}", endpoint.host, endpoint.port))
            })?;

        configure_tcp_keepalive(&tcp)?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {e}");
        }

        if !endpoint.tls {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {e}", endpoint.host)))?;
        let tls = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Connection(format!("TLS handshake failed: {e}")))?;

        Ok(Box::new(tls))
    }
}

impl ChannelConnector for TlsProxyConnector {
    type Channel = ProxyChannel<Box<dyn ProxyIo>>;

    async fn connect(&self, proxy_url: &str, ticket: &SignedTicket) -> Result<Self::Channel> {
        let endpoint = ProxyEndpoint::parse(proxy_url)
            .map_err(|e| Error::Connection(e.to_string()))?;

        let stream = self.open(&endpoint).await?;
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            "Connected to image proxy"
        );

        Ok(ProxyChannel::new(stream, &endpoint, ticket))
    }
}

/// Enable TCP keep-alive so idle pauses do not drop the proxy connection.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on proxy socket");
    Ok(())
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct AcceptAnyCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pem_rejects_empty_bundle() {
        let err = TlsProxyConnector::from_pem(b"").unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_from_config_requires_trust_anchor() {
        let config = Config::default();
        assert!(matches!(
            TlsProxyConnector::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_config_insecure_keeps_timeout() {
        let mut config = Config::default();
        config.control_plane.insecure = true;
        config.transfer.connect_timeout = Duration::from_secs(7);

        let connector = TlsProxyConnector::from_config(&config).unwrap();
        assert_eq!(connector.connect_timeout, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TlsProxyConnector::insecure();
        let err = connector
            .connect(
                &format!("http://127.0.0.1:{port}/images/t"),
                &SignedTicket::new("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
