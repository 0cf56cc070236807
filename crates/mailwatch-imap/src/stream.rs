//! TLS transport for IMAP connections.

#![allow(clippy::missing_errors_doc)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{Error, Result};

/// Bound on the TCP connect and on the TLS handshake, each.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the connection gets encrypted. Plaintext sessions are not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// TLS from the first byte.
    #[default]
    Tls,
    /// Plaintext greeting, upgraded with STARTTLS before login.
    StartTls,
}

impl Security {
    /// Well-known port: 993 for TLS, 143 for STARTTLS.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Tls => 993,
            Self::StartTls => 143,
        }
    }
}

/// Encrypted stream produced by [`connect_tls`] and [`upgrade_to_tls`].
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Byte stream an IMAP session can run over.
///
/// Implemented for every suitable stream; in-memory duplex pipes qualify,
/// which is what the tests use.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static {}

/// Creates a TLS connector with the webpki root certificates.
#[must_use]
pub fn create_tls_connector() -> TlsConnector {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Opens a TCP connection to `host:port` within [`CONNECT_TIMEOUT`].
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    tracing::debug!(host, port, "opening TCP connection");
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
        .map_err(Error::from)
}

/// Runs the TLS handshake over an established TCP stream, verifying the
/// certificate against `host`.
pub async fn upgrade_to_tls(tcp: TcpStream, host: &str) -> Result<TlsStream> {
    let server_name = ServerName::try_from(host.to_string())?;
    tokio::time::timeout(CONNECT_TIMEOUT, create_tls_connector().connect(server_name, tcp))
        .await
        .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
        .map_err(Error::from)
}

/// Connects to a server with TLS from the start.
pub async fn connect_tls(host: &str, port: u16) -> Result<TlsStream> {
    let tcp = connect_tcp(host, port).await?;
    upgrade_to_tls(tcp, host).await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn assert_transport<T: Transport>() {}

    #[test]
    fn test_streams_are_transports() {
        assert_transport::<TlsStream>();
        assert_transport::<tokio::io::DuplexStream>();
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Security::default(), Security::Tls);
        assert_eq!(Security::Tls.default_port(), 993);
        assert_eq!(Security::StartTls.default_port(), 143);
    }

    #[test]
    fn test_security_names() {
        let parsed: Security = serde_json::from_str("\"starttls\"").unwrap();
        assert_eq!(parsed, Security::StartTls);
        assert_eq!(serde_json::to_string(&Security::Tls).unwrap(), "\"tls\"");
    }

    #[tokio::test]
    async fn test_invalid_dns_name_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();

        let err = upgrade_to_tls(tcp, "not a hostname").await.unwrap_err();
        assert!(matches!(err, Error::InvalidDnsName(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_tcp("127.0.0.1", port).await.unwrap_err();
        assert!(err.is_transport());
    }
}
