//! Single framed connection to a cluster node.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use reef_core::error::{CoreError, Result};
use reef_core::protocol::{KvCodec, KvFrame};

/// Byte stream a KV connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// A boxed transport, plain or TLS.
pub type BoxedTransport = Box<dyn Transport>;

/// A framed KV connection.
///
/// Used sequentially during bootstrap; afterwards the endpoint splits the
/// transport into independent read and write halves.
pub struct KvConnection {
    transport: BoxedTransport,
    codec: KvCodec,
    read_buffer: BytesMut,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for KvConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl KvConnection {
    /// Wraps an established transport.
    pub fn new(
        transport: BoxedTransport,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            transport,
            codec: KvCodec::new(),
            read_buffer: BytesMut::with_capacity(8192),
            local_addr,
            peer_addr,
        }
    }

    /// Establishes a plain TCP connection within the given timeout.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                CoreError::Io(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", address, timeout),
                )))
            })??;

        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        tracing::debug!(address = %address, "established connection");
        Ok(Self::new(Box::new(stream), local_addr, peer_addr))
    }

    /// Returns the local socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the remote socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Sends a single frame.
    pub async fn send(&mut self, frame: KvFrame) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.wire_size());
        self.codec.encode(frame, &mut buf)?;
        self.transport.write_all(&buf).await?;
        Ok(())
    }

    /// Receives the next frame.
    ///
    /// Returns `None` if the connection closed cleanly between frames.
    pub async fn receive(&mut self) -> Result<Option<KvFrame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = self.transport.read_buf(&mut self.read_buffer).await?;
            if bytes_read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CoreError::Protocol(
                    "connection closed mid-frame".to_string(),
                ));
            }
        }
    }

    /// Tears the connection apart for split read/write operation.
    ///
    /// Returns the transport and any bytes already read but not yet decoded.
    pub fn into_parts(self) -> (BoxedTransport, BytesMut) {
        (self.transport, self.read_buffer)
    }
}

#[cfg(feature = "tls")]
pub use tls::connect_tls;

#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use std::sync::Arc;
    use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
    use tokio_rustls::TlsConnector;

    /// Establishes a TLS connection using the webpki root store.
    pub async fn connect_tls(host: &str, port: u16, timeout: Duration) -> Result<KvConnection> {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let address = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                CoreError::Io(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", address, timeout),
                )))
            })??;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();

        let server_name = ServerName::try_from(host)
            .map_err(|_| CoreError::Config(format!("invalid TLS server name '{}'", host)))?;
        let tls_stream = connector.connect(server_name, stream).await?;

        tracing::debug!(address = %address, "established TLS connection");
        Ok(KvConnection::new(
            Box::new(tls_stream),
            local_addr,
            peer_addr,
        ))
    }
}
