//! Remote mailbox maintenance
//!
//! Out-of-band operations the relay itself never performs: emptying
//! the remote INBOX and refreshing the quota snapshot. Both run over
//! a standard IMAP client connection to the configured upstream,
//! authenticated with the credentials a relay session captured from
//! the mail app's own LOGIN. They are invoked from the control
//! surface, not from the relay data path.

use crate::config::RelayConfig;
use crate::connection::tls_connector;
use crate::error::{Error, Result};
use crate::store::Store;
use async_imap::Session;
use futures::StreamExt;
use rustls::pki_types::ServerName;
use std::fmt::Debug;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info};

/// Mark every message in INBOX deleted and expunge. Returns how many
/// messages the mailbox reported before the expunge.
///
/// # Errors
///
/// Returns an error when no credentials have been captured yet, or
/// when the connection or any IMAP command fails.
pub async fn empty_inbox(config: &RelayConfig, store: &Store) -> Result<u32> {
    if config.upstream_tls {
        let mut session = connect_tls(config, store).await?;
        let removed = empty_with(&mut session).await?;
        session.logout().await.ok();
        Ok(removed)
    } else {
        let mut session = connect_plain(config, store).await?;
        let removed = empty_with(&mut session).await?;
        session.logout().await.ok();
        Ok(removed)
    }
}

/// Refresh the `serverstats` snapshot: INBOX message count and quota
/// bytes used. Returns the new (messages, bytes) pair.
///
/// # Errors
///
/// Returns an error when no credentials have been captured yet, or
/// when the connection, SELECT, or quota query fails.
pub async fn refresh_quota(config: &RelayConfig, store: &Store) -> Result<(u64, u64)> {
    let stats = if config.upstream_tls {
        let mut session = connect_tls(config, store).await?;
        let stats = quota_with(&mut session).await?;
        session.logout().await.ok();
        stats
    } else {
        let mut session = connect_plain(config, store).await?;
        let stats = quota_with(&mut session).await?;
        session.logout().await.ok();
        stats
    };
    store.set_serverstats(stats.0, stats.1);
    Ok(stats)
}

// -- private helpers --

fn credentials(store: &Store) -> Result<(String, String)> {
    store
        .credentials()
        .ok_or_else(|| Error::Imap("No credentials captured yet".to_string()))
}

async fn connect_plain(
    config: &RelayConfig,
    store: &Store,
) -> Result<Session<tokio_util::compat::Compat<TcpStream>>> {
    let (user, pass) = credentials(store)?;
    debug!("Connecting to IMAP server at {}", config.imap_upstream);

    let tcp_stream = TcpStream::connect(&config.imap_upstream).await?;
    let client = async_imap::Client::new(tcp_stream.compat());
    let session = client
        .login(&user, &pass)
        .await
        .map_err(|(e, _)| Error::Imap(format!("Login failed: {e}")))?;

    info!("Connected to IMAP server");
    Ok(session)
}

async fn connect_tls(
    config: &RelayConfig,
    store: &Store,
) -> Result<Session<tokio_util::compat::Compat<tokio_rustls::client::TlsStream<TcpStream>>>> {
    let (user, pass) = credentials(store)?;
    debug!("Connecting to IMAP server at {} (TLS)", config.imap_upstream);

    let tcp_stream = TcpStream::connect(&config.imap_upstream).await?;
    let host = config
        .imap_upstream
        .split(':')
        .next()
        .unwrap_or(&config.imap_upstream)
        .to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;
    let tls_stream = tls_connector()
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let client = async_imap::Client::new(tls_stream.compat());
    let session = client
        .login(&user, &pass)
        .await
        .map_err(|(e, _)| Error::Imap(format!("Login failed: {e}")))?;

    info!("Connected to IMAP server");
    Ok(session)
}

async fn empty_with<S>(session: &mut Session<S>) -> Result<u32>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Debug + Send,
{
    let mailbox = session
        .select("INBOX")
        .await
        .map_err(|e| Error::Imap(format!("Failed to select INBOX: {e}")))?;

    if mailbox.exists == 0 {
        return Ok(0);
    }

    {
        let updates = session
            .uid_store("1:*", "+FLAGS.SILENT (\\Deleted)")
            .await
            .map_err(|e| Error::Imap(format!("Store failed: {e}")))?;
        let _ = updates.collect::<Vec<_>>().await;
    }
    {
        let expunged = session
            .expunge()
            .await
            .map_err(|e| Error::Imap(format!("Expunge failed: {e}")))?;
        let _ = expunged.collect::<Vec<_>>().await;
    }

    info!("Emptied INBOX ({} messages)", mailbox.exists);
    Ok(mailbox.exists)
}

async fn quota_with<S>(session: &mut Session<S>) -> Result<(u64, u64)>
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Debug + Send,
{
    let mailbox = session
        .select("INBOX")
        .await
        .map_err(|e| Error::Imap(format!("Failed to select INBOX: {e}")))?;
    let messages = u64::from(mailbox.exists);

    let id = session
        .run_command("GETQUOTAROOT INBOX")
        .await
        .map_err(|e| Error::Imap(format!("Quota query failed: {e}")))?;
    let mut response = Vec::new();
    while let Some(data) = session
        .read_response()
        .await
        .map_err(|e| Error::Imap(format!("Quota query failed: {e}")))?
    {
        response.extend_from_slice(data.borrow_owner());
        if data.request_id() == Some(&id) {
            break;
        }
    }

    // RFC 2087 reports the STORAGE resource in KiB.
    let used = parse_quota_storage(&response).unwrap_or(0) * 1024;
    Ok((messages, used))
}

/// Pull the used-KiB figure out of a QUOTA response such as
/// `* QUOTA "" (STORAGE 512 10240)`.
fn parse_quota_storage(response: &[u8]) -> Option<u64> {
    let at = memchr::memmem::find(response, b"(STORAGE ")?;
    let rest = &response[at + b"(STORAGE ".len()..];
    let end = rest.iter().position(|b| !b.is_ascii_digit())?;
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}
