//! Bandwidth-optimizing IMAP/SMTP relay
//!
//! A transparent, protocol-aware relay that sits between a mobile
//! mail app and a remote IMAP/SMTP server reachable only over a
//! metered, high-latency link. Every byte is forwarded in both
//! directions; selected traffic is rewritten in flight to shrink the
//! transferred volume — noisy outgoing headers are dropped, fetches
//! are narrowed to a filtered header set, and the server's STARTTLS
//! offer is suppressed — without either peer ever observing a
//! non-compliant stream.

mod config;
mod connection;
mod error;
mod headers;
mod imap;
mod listener;
mod maintenance;
mod relay;
mod rewrite;
mod smtp;
mod store;

pub use config::RelayConfig;
pub use connection::{PeerStream, connect_upstream};
pub use error::{Error, Result};
pub use imap::ImapRewriter;
pub use listener::{Listener, nudge, start};
pub use maintenance::{empty_inbox, refresh_quota};
pub use relay::Session;
pub use rewrite::{Action, Direction, Rewriter};
pub use smtp::SmtpRewriter;
pub use store::{DEFAULT_IGNORED_HEADERS, Store, keys};
