//! Upstream connection and TLS helpers
//!
//! Provides the low-level `connect_upstream()` used by the listener
//! for every accepted session, and the TLS connector shared with the
//! maintenance client. The default deployment talks plaintext to the
//! remote server; an SSL-wrapped upstream variant exists for
//! deployments where the remote endpoints are TLS-only. The relay
//! itself never terminates TLS on the client side.

use crate::error::{Error, Result};
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Either side of a relayed session, socket or TLS-wrapped socket.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

/// Build a TLS connector trusting the webpki root set.
///
/// The upstream is a public mail server, so certificates are verified
/// against the standard roots.
#[must_use]
pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Open a connection to the real server behind the relay.
///
/// `addr` is `host:port`. With `tls` set, the TCP stream is wrapped
/// in a verified TLS session using the host part as SNI.
///
/// # Errors
///
/// Returns `Error::Io` when the TCP connect fails, `Error::Tls` when
/// the handshake fails or the host name is not a valid server name.
pub async fn connect_upstream(addr: &str, tls: bool) -> Result<Box<dyn PeerStream>> {
    debug!("Connecting upstream to {addr}");
    let tcp_stream = TcpStream::connect(addr).await?;

    if !tls {
        return Ok(Box::new(tcp_stream));
    }

    let host = addr.split(':').next().unwrap_or(addr).to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;
    let tls_stream = tls_connector()
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Box::new(tls_stream))
}
