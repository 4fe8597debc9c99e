//! Protocol listeners and relay lifecycle
//!
//! One listener per protocol, each owning its port and its rewriter.
//! Every accepted connection is checked against the store's stop flag
//! first: a set flag closes the listening socket and stops accepting,
//! while sessions already in flight run to natural completion. This
//! is why requesting a stop also opens one throwaway connection per
//! port — it unblocks the pending accept so the flag is observed.

use crate::config::RelayConfig;
use crate::connection::connect_upstream;
use crate::error::Result;
use crate::imap::ImapRewriter;
use crate::relay::Session;
use crate::rewrite::Rewriter;
use crate::smtp::SmtpRewriter;
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Accept loop for one protocol.
pub struct Listener {
    listener: TcpListener,
    upstream: String,
    tls: bool,
    rewriter: Arc<dyn Rewriter>,
    store: Arc<Store>,
}

impl Listener {
    /// Bind the listening socket. Port 0 asks the OS for a free port;
    /// `local_addr` reports what was actually bound.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the bind fails. A bind failure is
    /// fatal to this protocol's listener only.
    pub async fn bind(
        port: u16,
        upstream: String,
        tls: bool,
        rewriter: Arc<dyn Rewriter>,
        store: Arc<Store>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            listener,
            upstream,
            tls,
            rewriter,
            store,
        })
    }

    /// The bound address, for tests and the stop nudge.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the stop flag is observed or accepting fails.
    /// Each accepted connection gets its own task owning both sockets
    /// for the session's lifetime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when `accept` fails; other listeners and
    /// running sessions are unaffected.
    pub async fn run(self) -> Result<()> {
        let protocol = self.rewriter.protocol();
        info!(
            "{protocol} listener on {} forwarding to {}",
            self.listener.local_addr()?,
            self.upstream
        );

        loop {
            let (socket, addr) = self.listener.accept().await?;
            if self.store.stop() {
                info!("stop requested, closing {protocol} listener");
                return Ok(());
            }

            let upstream = self.upstream.clone();
            let tls = self.tls;
            let rewriter = self.rewriter.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                match connect_upstream(&upstream, tls).await {
                    Ok(up) => {
                        let session =
                            Session::new(socket, up, rewriter, store, addr.to_string());
                        if let Err(e) = session.run().await {
                            warn!("{addr} session ended: {e}");
                        } else {
                            info!("{addr} session closed");
                        }
                    }
                    Err(e) => warn!("{addr} upstream connect failed: {e}"),
                }
            });
        }
    }
}

/// Start both protocol listeners and run until each observes the stop
/// flag. A failed listener takes down only its own protocol; the
/// other keeps accepting.
///
/// # Errors
///
/// Returns the first bind error; accept-loop errors are logged and
/// swallowed so the sibling listener keeps running.
pub async fn start(config: &RelayConfig, store: Arc<Store>) -> Result<()> {
    let imap = Listener::bind(
        config.imap_port,
        config.imap_upstream.clone(),
        config.upstream_tls,
        Arc::new(ImapRewriter::new(&store)),
        store.clone(),
    )
    .await?;
    let smtp = Listener::bind(
        config.smtp_port,
        config.smtp_upstream.clone(),
        config.upstream_tls,
        Arc::new(SmtpRewriter::new()),
        store,
    )
    .await?;

    let (imap_done, smtp_done) = tokio::join!(
        tokio::spawn(imap.run()),
        tokio::spawn(smtp.run()),
    );
    for done in [imap_done, smtp_done] {
        match done {
            Ok(Err(e)) => warn!("listener failed: {e}"),
            Err(e) => warn!("listener task panicked: {e}"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

/// Unblock a listener's pending accept so it can observe the stop
/// flag. Connection refused just means it is already gone.
pub async fn nudge(port: u16) {
    let _ = TcpStream::connect(("127.0.0.1", port)).await;
}
