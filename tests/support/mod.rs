//! Scripted fake peer for integration testing
//!
//! The relay must be exercised on exact wire bytes — its whole job is
//! byte-precise mutation — so the fake upstream does not implement a
//! protocol state machine. It plays a fixed script: `Send` steps write
//! bytes to the relay, `Expect` steps read exactly the bytes the relay
//! should have forwarded and assert on them. A deviation fails the
//! script task, which `finish()` surfaces in the test.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One step of a fake upstream's conversation.
pub enum Step {
    /// Write these bytes to the connected relay.
    Send(Vec<u8>),
    /// Read exactly this many bytes and assert they match.
    Expect(Vec<u8>),
}

/// A single-connection scripted server on an ephemeral port.
pub struct FakeUpstream {
    addr: String,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeUpstream {
    /// Bind, then accept one connection in the background and play
    /// the script against it.
    pub async fn start(script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let addr = format!(
            "127.0.0.1:{}",
            listener.local_addr().expect("local addr").port()
        );

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            for step in script {
                match step {
                    Step::Send(bytes) => {
                        stream.write_all(&bytes).await.expect("script send");
                        stream.flush().await.expect("script flush");
                    }
                    Step::Expect(expected) => {
                        let mut got = vec![0u8; expected.len()];
                        stream.read_exact(&mut got).await.expect("script read");
                        assert_eq!(
                            String::from_utf8_lossy(&got),
                            String::from_utf8_lossy(&expected),
                            "relay forwarded unexpected bytes"
                        );
                    }
                }
            }
        });

        Self { addr, handle }
    }

    /// The `host:port` the relay should forward to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Wait for the script to complete, propagating any assertion.
    pub async fn finish(self) {
        self.handle.await.expect("fake upstream script failed");
    }
}

/// Read exactly `expected.len()` bytes from `stream` and assert they
/// match.
pub async fn expect_bytes<S: AsyncRead + Unpin>(stream: &mut S, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).await.expect("read from relay");
    assert_eq!(
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected),
        "relay delivered unexpected bytes"
    );
}
