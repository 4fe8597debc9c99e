//! Protocol rewriter seam
//!
//! A [`Rewriter`] is what makes the relay protocol-aware: it decides
//! when an accumulated buffer is one complete protocol unit for a
//! given direction (framing), and what bytes to actually forward for
//! a complete unit (rewriting). The relay engine is otherwise
//! protocol-agnostic; listeners pick the concrete implementation at
//! construction time.

use crate::store::Store;
use std::fmt;

/// Which peer produced the bytes being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Mail client -> remote server.
    ClientToUpstream,
    /// Remote server -> mail client.
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client->upstream"),
            Self::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// What the relay engine should do with a rewritten unit.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward these bytes to the opposite peer.
    Forward(Vec<u8>),
    /// Write `reply` back to the *sending* peer, forward `forward` to
    /// the opposite peer, then end the session without waiting for
    /// the opposite peer to answer.
    ReplyAndClose { reply: Vec<u8>, forward: Vec<u8> },
}

impl Action {
    /// The bytes that will be sent to the opposite peer.
    #[must_use]
    pub fn forwarded(&self) -> &[u8] {
        match self {
            Self::Forward(data) | Self::ReplyAndClose { forward: data, .. } => data,
        }
    }
}

/// Framing predicate plus rewrite function for one protocol.
///
/// `rewrite` must never fail the stream: implementations recover from
/// any internal parse problem by returning the unit unchanged. The
/// byte length a rule emits must stay consistent with any
/// length-prefix fields it itself declares.
pub trait Rewriter: Send + Sync {
    /// Protocol tag used for logging and counter selection.
    fn protocol(&self) -> &'static str;

    /// Is the accumulated `buf` a complete protocol unit for this
    /// direction? Called after every read; the engine keeps reading
    /// the same peer until this returns true.
    fn unit_complete(&self, direction: Direction, buf: &[u8]) -> bool;

    /// Rewrite one complete unit. `store` carries the mode flags and
    /// receives message-counter increments and captured credentials.
    fn rewrite(&self, direction: Direction, unit: Vec<u8>, store: &Store) -> Action;
}
