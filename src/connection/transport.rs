use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

#[cfg(feature = "transport-tls")]
use std::sync::Arc;

#[cfg(feature = "transport-tls")]
pub type TlsConfig = Option<Arc<rustls::ClientConfig>>;

#[cfg(not(feature = "transport-tls"))]
pub type TlsConfig = ();

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("IO Error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[cfg(feature = "transport-tls")]
    #[error("Invalid Host-Port string: {0}")]
    InvalidHostPort(String),

    #[cfg(feature = "transport-tls")]
    #[error("Invalid server name: {0}")]
    BadServerName(#[from] rustls::pki_types::InvalidDnsNameError),

    #[cfg(feature = "transport-tls")]
    #[error("TLS Error: {0}")]
    Tls(#[from] rustls::Error),

    #[cfg(feature = "transport-tls")]
    #[error("No certificate found in PEM data")]
    NoCertificates,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),

    #[cfg(feature = "transport-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(inner) => Pin::new(inner).poll_read(cx, buf),

            #[cfg(feature = "transport-tls")]
            Self::Tls(inner) => Pin::new(&mut **inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match self.get_mut() {
            Self::Plain(inner) => Pin::new(inner).poll_write(cx, buf),

            #[cfg(feature = "transport-tls")]
            Self::Tls(inner) => Pin::new(&mut **inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            Self::Plain(inner) => Pin::new(inner).poll_flush(cx),

            #[cfg(feature = "transport-tls")]
            Self::Tls(inner) => Pin::new(&mut **inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            Self::Plain(inner) => Pin::new(inner).poll_shutdown(cx),

            #[cfg(feature = "transport-tls")]
            Self::Tls(inner) => Pin::new(&mut **inner).poll_shutdown(cx),
        }
    }
}

impl Transport {
    /// Dial `broker` (`host:port`), including the TLS handshake, within `dial_timeout`.
    pub async fn connect(
        broker: &str,
        tls_config: TlsConfig,
        dial_timeout: Duration,
    ) -> Result<Self> {
        tokio::time::timeout(dial_timeout, async {
            let tcp_stream = TcpStream::connect(broker).await?;
            Self::wrap_tls(tcp_stream, broker, tls_config).await
        })
        .await
        .map_err(|_| Error::Timeout(dial_timeout))?
    }

    #[cfg(feature = "transport-tls")]
    async fn wrap_tls(tcp_stream: TcpStream, broker: &str, tls_config: TlsConfig) -> Result<Self> {
        let config = match tls_config {
            Some(config) => config,
            None => return Ok(Self::Plain(tcp_stream)),
        };

        // Strip the port
        let host = broker
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .ok_or_else(|| Error::InvalidHostPort(broker.to_owned()))?;
        let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())?;

        let connector = tokio_rustls::TlsConnector::from(config);
        let tls_stream = connector.connect(server_name, tcp_stream).await?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }

    #[cfg(not(feature = "transport-tls"))]
    async fn wrap_tls(tcp_stream: TcpStream, _broker: &str, _tls_config: TlsConfig) -> Result<Self> {
        Ok(Self::Plain(tcp_stream))
    }
}

/// Client config trusting the certificates of a PEM bundle.
#[cfg(feature = "transport-tls")]
pub fn tls_config_from_pem(pem: &[u8]) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert?)?;
    }

    if roots.is_empty() {
        return Err(Error::NoCertificates);
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
