//! Per-session relay engine
//!
//! One `Session` owns exactly two byte streams — the accepted mail
//! client and the connection to the real server — and pumps complete
//! protocol units between them: read from whichever side is ready,
//! keep reading that side until the rewriter declares the unit
//! framed, rewrite, forward, count. Units never interleave within a
//! direction and are forwarded in the exact order they were framed.
//!
//! The engine is generic over the stream types so tests drive it with
//! in-memory duplex pipes instead of sockets.

use crate::error::Result;
use crate::rewrite::{Action, Direction, Rewriter};
use crate::store::Store;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const READ_CHUNK: usize = 4096;

/// One relayed connection pair plus its protocol strategy.
pub struct Session<C, U> {
    client: C,
    upstream: U,
    rewriter: Arc<dyn Rewriter>,
    store: Arc<Store>,
    peer: String,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        client: C,
        upstream: U,
        rewriter: Arc<dyn Rewriter>,
        store: Arc<Store>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            client,
            upstream,
            rewriter,
            store,
            peer: peer.into(),
        }
    }

    /// Relay until either peer closes or an I/O error occurs.
    ///
    /// A zero-length read ends the session: closure is propagated to
    /// the other peer exactly once (write-half shutdown) and any
    /// partially accumulated unit is forwarded first, unmodified
    /// framing-wise but still run through the rewriter.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error on either stream; the caller logs
    /// it and lets the session die without affecting others.
    pub async fn run(self) -> Result<()> {
        let Self {
            client,
            upstream,
            rewriter,
            store,
            peer,
        } = self;
        let protocol = rewriter.protocol();
        info!("{peer} connected ({protocol})");

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        // Independent accumulation buffers, one per direction.
        let mut inbound = Vec::new(); // upstream -> client
        let mut outbound = Vec::new(); // client -> upstream
        let mut client_chunk = [0u8; READ_CHUNK];
        let mut upstream_chunk = [0u8; READ_CHUNK];

        loop {
            let (n, direction) = tokio::select! {
                r = client_r.read(&mut client_chunk) => (r?, Direction::ClientToUpstream),
                r = upstream_r.read(&mut upstream_chunk) => (r?, Direction::UpstreamToClient),
            };

            if n == 0 {
                info!("{peer} {direction}: peer closed, ending session");
                match direction {
                    Direction::ClientToUpstream => upstream_w.shutdown().await.ok(),
                    Direction::UpstreamToClient => client_w.shutdown().await.ok(),
                };
                return Ok(());
            }

            // Accumulate on the same side until the unit is framed.
            let (buf, peer_open) = match direction {
                Direction::ClientToUpstream => {
                    outbound.extend_from_slice(&client_chunk[..n]);
                    let open =
                        fill_unit(&mut client_r, &mut outbound, rewriter.as_ref(), direction)
                            .await?;
                    (&mut outbound, open)
                }
                Direction::UpstreamToClient => {
                    inbound.extend_from_slice(&upstream_chunk[..n]);
                    let open =
                        fill_unit(&mut upstream_r, &mut inbound, rewriter.as_ref(), direction)
                            .await?;
                    (&mut inbound, open)
                }
            };

            let unit = std::mem::take(buf);
            let action = rewriter.rewrite(direction, unit, &store);
            let sent = action.forwarded().len() as u64;

            let close_after = match direction {
                Direction::ClientToUpstream => match action {
                    Action::Forward(data) => {
                        upstream_w.write_all(&data).await?;
                        upstream_w.flush().await?;
                        record_unit(&store, protocol, &peer, direction, &data, sent);
                        false
                    }
                    Action::ReplyAndClose { reply, forward } => {
                        client_w.write_all(&reply).await?;
                        client_w.flush().await?;
                        upstream_w.write_all(&forward).await?;
                        upstream_w.flush().await?;
                        record_unit(&store, protocol, &peer, direction, &forward, sent);
                        info!("{peer} answered locally, closing session");
                        true
                    }
                },
                Direction::UpstreamToClient => match action {
                    Action::Forward(data) | Action::ReplyAndClose { forward: data, .. } => {
                        client_w.write_all(&data).await?;
                        client_w.flush().await?;
                        record_unit(&store, protocol, &peer, direction, &data, sent);
                        false
                    }
                },
            };

            if close_after {
                client_w.shutdown().await.ok();
                return Ok(());
            }
            if !peer_open {
                info!("{peer} {direction}: peer closed mid-unit, ending session");
                match direction {
                    Direction::ClientToUpstream => upstream_w.shutdown().await.ok(),
                    Direction::UpstreamToClient => client_w.shutdown().await.ok(),
                };
                return Ok(());
            }
        }
    }
}

/// Keep reading `reader` until the rewriter sees a complete unit.
/// Returns whether the peer is still open (false: closed mid-unit,
/// the partial buffer is all there will ever be).
async fn fill_unit<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    rewriter: &dyn Rewriter,
    direction: Direction,
) -> std::io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    while !rewriter.unit_complete(direction, buf) {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// One log record per forwarded unit, plus the byte counter update.
/// The raw bytes are only included while the savelog flag is on.
fn record_unit(
    store: &Store,
    protocol: &'static str,
    peer: &str,
    direction: Direction,
    data: &[u8],
    sent: u64,
) {
    let total = if protocol == "IMAP" {
        store.add_imap(sent)
    } else {
        store.add_smtp(sent)
    };
    if store.savelog() {
        debug!(
            "{peer} {direction} wrote:\n{}\n{sent} bytes\n{protocol} total: {total} bytes",
            String::from_utf8_lossy(data)
        );
    } else {
        debug!("{peer} {direction}: {sent} bytes, {protocol} total: {total} bytes");
    }
}
