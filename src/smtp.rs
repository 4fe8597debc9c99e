//! SMTP rewriter
//!
//! Client->upstream traffic is mostly single CRLF-terminated command
//! lines; the exception is the data phase, where the client streams a
//! whole RFC 5322 message terminated by CRLF`.`CRLF. A unit that
//! carries a `Content-Type:` header is such a message, and in
//! optimize mode its noisy headers are dropped before forwarding.
//!
//! Upstream->client traffic is CRLF-terminated reply lines; the EHLO
//! capability banner loses its STARTTLS offer so the client never
//! attempts an upgrade on the relayed connection.

use crate::headers::HeaderBlock;
use crate::rewrite::{Action, Direction, Rewriter};
use crate::store::Store;
use memchr::memmem;
use tracing::{debug, warn};

/// Data-phase accumulation bound. A message larger than this streams
/// through in cutoff-sized chunks; only the first, header-bearing
/// chunk is eligible for rewriting.
pub const MAX_DATA_BUFFER: usize = 4096;

const CRLF: &[u8] = b"\r\n";
const DATA_TERMINATOR: &[u8] = b"\r\n.\r\n";
const QUIT: &[u8] = b"QUIT\r\n";
const QUIT_REPLY: &[u8] = b"250 2.0.0 Bye\r\n";
const STARTTLS_LINE: &[u8] = b"\r\n250-STARTTLS\r\n";
const QUEUED_PREFIX: &[u8] = b"250 2.0.0 Ok: queued as ";

/// Headers dropped from outgoing messages, each at most once.
const STRIPPED_HEADERS: [&str; 5] = [
    "Autocrypt",
    "X-Mailer",
    "Subject",
    "References",
    "In-Reply-To",
];

/// SMTP framing and rewrite rules.
#[derive(Debug, Default)]
pub struct SmtpRewriter;

impl SmtpRewriter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Drop noisy headers and de-name the `To:` addresses of an
    /// outgoing message. Falls back to the original bytes when the
    /// unit has no parsable header block.
    fn optimize_message(unit: &[u8]) -> Vec<u8> {
        let Some(mut block) = HeaderBlock::parse(unit) else {
            warn!("outgoing message without header block, forwarding unmodified");
            return unit.to_vec();
        };
        for name in STRIPPED_HEADERS {
            if block.strip_first(name) {
                debug!("stripped outgoing header {name}");
            }
        }
        block.rewrite_to();
        block.unparse()
    }
}

impl Rewriter for SmtpRewriter {
    fn protocol(&self) -> &'static str {
        "SMTP"
    }

    fn unit_complete(&self, direction: Direction, buf: &[u8]) -> bool {
        match direction {
            Direction::UpstreamToClient => buf.ends_with(CRLF),
            Direction::ClientToUpstream => {
                if memmem::find(buf, b"Content-Type:").is_some() {
                    buf.ends_with(DATA_TERMINATOR) || buf.len() >= MAX_DATA_BUFFER
                } else {
                    buf.ends_with(CRLF)
                }
            }
        }
    }

    fn rewrite(&self, direction: Direction, unit: Vec<u8>, store: &Store) -> Action {
        match direction {
            Direction::ClientToUpstream => {
                if !store.optimize() {
                    return Action::Forward(unit);
                }
                if memmem::find(&unit, b"Content-Type:").is_some() {
                    return Action::Forward(Self::optimize_message(&unit));
                }
                if unit == QUIT {
                    // Answer for the server and hang up; the metered
                    // link never carries the goodbye round trip.
                    return Action::ReplyAndClose {
                        reply: QUIT_REPLY.to_vec(),
                        forward: unit,
                    };
                }
                Action::Forward(unit)
            }
            Direction::UpstreamToClient => {
                if unit.starts_with(b"250-") {
                    return Action::Forward(strip_starttls_line(unit));
                }
                if unit.starts_with(QUEUED_PREFIX) {
                    store.incr_smtp_msgs();
                }
                Action::Forward(unit)
            }
        }
    }
}

/// Delete the `250-STARTTLS` line from a multi-line EHLO banner.
/// A no-op on banners that do not (or no longer) offer it.
fn strip_starttls_line(unit: Vec<u8>) -> Vec<u8> {
    let Some(pos) = memmem::find(&unit, STARTTLS_LINE) else {
        return unit;
    };
    let mut out = Vec::with_capacity(unit.len() - STARTTLS_LINE.len() + 2);
    out.extend_from_slice(&unit[..pos]);
    out.extend_from_slice(CRLF);
    out.extend_from_slice(&unit[pos + STARTTLS_LINE.len()..]);
    out
}
