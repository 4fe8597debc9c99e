//! IMAP rewriter
//!
//! Two bandwidth savings happen here. Client->upstream, a full-body
//! `UID FETCH ... (FLAGS BODY.PEEK[])` request is narrowed at the
//! source into a filtered-header fetch plus a text fetch, so the
//! ignored headers never cross the metered link. Upstream->client,
//! the resulting two-literal FETCH response is recombined into the
//! single `BODY[]` literal the client originally asked for, with the
//! declared byte count recomputed to match exactly — if the count and
//! the bytes that follow ever disagree, the client's parser
//! desynchronizes from the stream, so any parse doubt falls back to
//! forwarding the response untouched.
//!
//! The relay also suppresses the server's STARTTLS offer and captures
//! the LOGIN credentials for the out-of-band maintenance operations.

use crate::rewrite::{Action, Direction, Rewriter};
use crate::store::Store;
use memchr::memmem;
use tracing::{debug, warn};

const CRLF: &[u8] = b"\r\n";
const FETCH_END: &[u8] = b"OK Fetch completed.\r\n";
const CAPABILITY_PREFIX: &[u8] = b"* OK [CAPABILITY ";
const PEEK_SUFFIX: &[u8] = b" (FLAGS BODY.PEEK[])\r\n";
const TEXT_MARKER: &[u8] = b"\r\n\r\n BODY[TEXT] {";

/// Byte strings precompiled from the configured ignored-header list:
/// the request suffix substituted into narrowed fetches, and the
/// response marker located when recombining the reply literals.
#[derive(Debug)]
struct FetchOptimizer {
    request_suffix: Vec<u8>,
    header_marker: Vec<u8>,
}

impl FetchOptimizer {
    fn new(ignored_headers: &str) -> Self {
        Self {
            request_suffix: format!(
                " (FLAGS BODY.PEEK[HEADER.FIELDS.NOT ({ignored_headers})] BODY.PEEK[TEXT])\r\n"
            )
            .into_bytes(),
            header_marker: format!(") BODY[HEADER.FIELDS.NOT ({ignored_headers})] {{")
                .into_bytes(),
        }
    }
}

/// IMAP framing and rewrite rules.
///
/// The ignored-header list is read from the store once, at relay
/// startup; all IMAP sessions share the precompiled byte strings.
#[derive(Debug)]
pub struct ImapRewriter {
    optimizer: FetchOptimizer,
}

impl ImapRewriter {
    #[must_use]
    pub fn new(store: &Store) -> Self {
        Self::with_ignored_headers(&store.ignored_headers())
    }

    #[must_use]
    pub fn with_ignored_headers(ignored_headers: &str) -> Self {
        Self {
            optimizer: FetchOptimizer::new(ignored_headers),
        }
    }

    /// Collapse the filtered-header and text literals of a FETCH
    /// response into one contiguous `BODY[]` literal.
    ///
    /// `None` means a marker or count did not parse; the caller
    /// forwards the response unmodified.
    fn recombine_literals(&self, unit: &[u8]) -> Option<Vec<u8>> {
        let header_at = memmem::find(unit, &self.optimizer.header_marker)?;
        let (header_len, after) =
            parse_count(unit, header_at + self.optimizer.header_marker.len())?;
        if unit.get(after) != Some(&b'}') {
            return None;
        }
        let header_end = after + 1;

        let text_at = header_end + memmem::find(&unit[header_end..], TEXT_MARKER)?;
        let (text_len, after) = parse_count(unit, text_at + TEXT_MARKER.len())?;
        if !unit[after..].starts_with(b"}\r\n") {
            return None;
        }
        let text_start = after + 3;

        // One BODY[] literal: the header part keeps its final blank
        // line, the text bytes follow directly, and the declared
        // count is the exact sum of what now follows.
        let mut out = Vec::with_capacity(unit.len());
        out.extend_from_slice(&unit[..header_at]);
        out.extend_from_slice(b") BODY[] {");
        out.extend_from_slice((header_len + text_len).to_string().as_bytes());
        out.push(b'}');
        out.extend_from_slice(&unit[header_end..text_at]);
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&unit[text_start..]);
        Some(out)
    }
}

impl Rewriter for ImapRewriter {
    fn protocol(&self) -> &'static str {
        "IMAP"
    }

    fn unit_complete(&self, direction: Direction, buf: &[u8]) -> bool {
        match direction {
            Direction::ClientToUpstream => buf.ends_with(CRLF),
            Direction::UpstreamToClient => {
                if is_fetch_response(buf) {
                    buf.ends_with(FETCH_END)
                } else {
                    buf.ends_with(CRLF)
                }
            }
        }
    }

    fn rewrite(&self, direction: Direction, unit: Vec<u8>, store: &Store) -> Action {
        match direction {
            Direction::ClientToUpstream => {
                if let Some((user, pass)) = parse_login(&unit) {
                    debug!("captured login credentials for {user}");
                    store.set_credentials(&user, &pass);
                    return Action::Forward(unit);
                }
                if store.optimize()
                    && unit.ends_with(PEEK_SUFFIX)
                    && memmem::find(&unit, b" UID FETCH ").is_some()
                {
                    let mut narrowed = unit;
                    narrowed.truncate(narrowed.len() - PEEK_SUFFIX.len());
                    narrowed.extend_from_slice(&self.optimizer.request_suffix);
                    return Action::Forward(narrowed);
                }
                Action::Forward(unit)
            }
            Direction::UpstreamToClient => {
                if unit.starts_with(CAPABILITY_PREFIX) {
                    return Action::Forward(strip_starttls_token(unit));
                }
                if is_fetch_response(&unit) {
                    let out = if store.optimize() {
                        match self.recombine_literals(&unit) {
                            Some(combined) => combined,
                            None => {
                                warn!("FETCH literal markers did not parse, forwarding unmodified");
                                unit
                            }
                        }
                    } else {
                        unit
                    };
                    store.incr_imap_msgs();
                    return Action::Forward(out);
                }
                Action::Forward(unit)
            }
        }
    }
}

/// Does the buffer open like `* <seq> FETCH (UID <uid> FLAGS (...) BODY`?
/// Once this matches, the unit runs until the fetch completion line.
fn is_fetch_response(buf: &[u8]) -> bool {
    fn inner(buf: &[u8]) -> Option<()> {
        let rest = buf.strip_prefix(b"* ")?;
        let rest = skip_digits(rest)?;
        let rest = rest.strip_prefix(b" FETCH (UID ")?;
        let rest = skip_digits(rest)?;
        let rest = rest.strip_prefix(b" FLAGS (")?;
        let line = &rest[..memmem::find(rest, CRLF).unwrap_or(rest.len())];
        memmem::find(line, b") BODY").map(|_| ())
    }
    inner(buf).is_some()
}

/// Consume one or more ASCII digits, returning the remainder.
fn skip_digits(buf: &[u8]) -> Option<&[u8]> {
    let end = buf.iter().position(|b| !b.is_ascii_digit())?;
    if end == 0 {
        return None;
    }
    Some(&buf[end..])
}

/// Parse the decimal count at `from`, returning (value, index one
/// past the last digit).
fn parse_count(unit: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut end = from;
    while unit.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    if end == from {
        return None;
    }
    let value = std::str::from_utf8(&unit[from..end]).ok()?.parse().ok()?;
    Some((value, end))
}

/// Match `<tag> LOGIN "<user>" "<pass>"\r\n` at the buffer start and
/// return the quoted values.
fn parse_login(unit: &[u8]) -> Option<(String, String)> {
    let space = memchr::memchr(b' ', unit)?;
    let tag = &unit[..space];
    if tag.is_empty() || !tag.iter().all(u8::is_ascii_alphanumeric) {
        return None;
    }
    let rest = unit[space + 1..].strip_prefix(b"LOGIN \"")?;
    let user_end = memchr::memchr(b'"', rest)?;
    let user = &rest[..user_end];
    let rest = rest[user_end + 1..].strip_prefix(b" \"")?;
    let pass_end = memchr::memchr(b'"', rest)?;
    let pass = &rest[..pass_end];
    if &rest[pass_end + 1..] != CRLF || user.is_empty() || pass.is_empty() {
        return None;
    }
    Some((
        String::from_utf8_lossy(user).into_owned(),
        String::from_utf8_lossy(pass).into_owned(),
    ))
}

/// Delete the STARTTLS token from a capability greeting, boundary
/// aware so no other token can be clipped. A no-op when absent.
fn strip_starttls_token(unit: Vec<u8>) -> Vec<u8> {
    const TOKEN: &[u8] = b" STARTTLS";
    let mut out = unit;
    while let Some(pos) = memmem::find(&out, TOKEN) {
        let boundary = out
            .get(pos + TOKEN.len())
            .is_none_or(|b| matches!(b, b' ' | b']' | b'\r'));
        if !boundary {
            break;
        }
        out.drain(pos..pos + TOKEN.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DEFAULT_IGNORED_HEADERS, keys};

    fn rewriter() -> ImapRewriter {
        ImapRewriter::with_ignored_headers(DEFAULT_IGNORED_HEADERS)
    }

    fn rewrite(direction: Direction, unit: &[u8], store: &Store) -> Vec<u8> {
        match rewriter().rewrite(direction, unit.to_vec(), store) {
            Action::Forward(data) => data,
            Action::ReplyAndClose { .. } => panic!("unexpected close"),
        }
    }

    /// A two-literal FETCH response as the upstream sends it after a
    /// narrowed fetch. Returns (unit, header literal, text literal).
    fn fetch_response() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let headers =
            b"From: alice@example.com\r\nDate: Mon, 01 Jan 2024 12:00:00 +0000\r\n\r\n".to_vec();
        let text = b"hello over the metered link\r\n".to_vec();
        let mut unit = format!(
            "* 3 FETCH (UID 77 FLAGS (\\Seen) \
             BODY[HEADER.FIELDS.NOT ({DEFAULT_IGNORED_HEADERS})] {{{}}}\r\n",
            headers.len()
        )
        .into_bytes();
        unit.extend_from_slice(&headers[..headers.len() - 4]);
        unit.extend_from_slice(format!("\r\n\r\n BODY[TEXT] {{{}}}\r\n", text.len()).into_bytes().as_slice());
        unit.extend_from_slice(&text);
        unit.extend_from_slice(b")\r\na005 OK Fetch completed.\r\n");
        (unit, headers, text)
    }

    // -- framing --

    #[test]
    fn client_unit_is_complete_at_crlf() {
        let r = rewriter();
        assert!(!r.unit_complete(Direction::ClientToUpstream, b"a001 NOOP"));
        assert!(r.unit_complete(Direction::ClientToUpstream, b"a001 NOOP\r\n"));
    }

    #[test]
    fn fetch_response_runs_until_completion_line() {
        let r = rewriter();
        let start = b"* 3 FETCH (UID 77 FLAGS (\\Seen) BODY[HEADER.FIELDS.NOT (X)] {5}\r\n";
        assert!(!r.unit_complete(Direction::UpstreamToClient, start));

        let (unit, _, _) = fetch_response();
        assert!(r.unit_complete(Direction::UpstreamToClient, &unit));
    }

    #[test]
    fn plain_response_is_complete_at_crlf() {
        let r = rewriter();
        assert!(r.unit_complete(Direction::UpstreamToClient, b"a001 OK NOOP done\r\n"));
        assert!(!r.unit_complete(Direction::UpstreamToClient, b"* 12 EXISTS"));
    }

    // -- client->upstream --

    #[test]
    fn uid_fetch_is_narrowed_with_ignored_headers() {
        let store = Store::in_memory();
        let out = rewrite(
            Direction::ClientToUpstream,
            b"a002 UID FETCH 1:* (FLAGS BODY.PEEK[])\r\n",
            &store,
        );
        let expected = format!(
            "a002 UID FETCH 1:* (FLAGS BODY.PEEK[HEADER.FIELDS.NOT \
             ({DEFAULT_IGNORED_HEADERS})] BODY.PEEK[TEXT])\r\n"
        );
        assert_eq!(out, expected.into_bytes());
    }

    #[test]
    fn other_fetches_are_untouched() {
        let store = Store::in_memory();
        let unit = b"a002 UID FETCH 1:* (FLAGS)\r\n";
        assert_eq!(rewrite(Direction::ClientToUpstream, unit, &store), unit);
    }

    #[test]
    fn normal_mode_does_not_narrow() {
        let store = Store::in_memory();
        store.set_optimize(false);
        let unit = b"a002 UID FETCH 1:* (FLAGS BODY.PEEK[])\r\n";
        assert_eq!(rewrite(Direction::ClientToUpstream, unit, &store), unit);
    }

    #[test]
    fn login_is_captured_and_forwarded_unmodified() {
        let store = Store::in_memory();
        let unit = b"a001 LOGIN \"bob\" \"secret\"\r\n";
        let out = rewrite(Direction::ClientToUpstream, unit, &store);
        assert_eq!(out, unit);
        assert_eq!(store.credentials(), Some(("bob".into(), "secret".into())));
    }

    #[test]
    fn non_login_commands_do_not_touch_credentials() {
        let store = Store::in_memory();
        rewrite(Direction::ClientToUpstream, b"a001 SELECT INBOX\r\n", &store);
        assert_eq!(store.credentials(), None);
    }

    // -- upstream->client --

    #[test]
    fn capability_greeting_loses_starttls_token() {
        let store = Store::in_memory();
        let unit = b"* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] Server ready.\r\n";
        let out = rewrite(Direction::UpstreamToClient, unit, &store);
        assert_eq!(
            out,
            b"* OK [CAPABILITY IMAP4rev1 LOGINDISABLED] Server ready.\r\n"
        );
    }

    #[test]
    fn starttls_strip_is_idempotent() {
        let store = Store::in_memory();
        let unit = b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n";
        let once = rewrite(Direction::UpstreamToClient, unit, &store);
        let twice = rewrite(Direction::UpstreamToClient, &once, &store);
        assert_eq!(once, b"* OK [CAPABILITY IMAP4rev1] ready\r\n");
        assert_eq!(once, twice);
    }

    #[test]
    fn starttls_like_tokens_survive() {
        let store = Store::in_memory();
        let unit = b"* OK [CAPABILITY IMAP4rev1 STARTTLSEXT] ready\r\n";
        let out = rewrite(Direction::UpstreamToClient, unit, &store);
        assert_eq!(out, unit);
    }

    #[test]
    fn fetch_literals_are_recombined_with_exact_count() {
        let store = Store::in_memory();
        let (unit, headers, text) = fetch_response();
        let out = rewrite(Direction::UpstreamToClient, &unit, &store);

        // exactly one literal, tagged BODY[]
        let marker = b") BODY[] {";
        let at = memmem::find(&out, marker).unwrap();
        assert!(memmem::find(&out[at + marker.len()..], b" BODY[").is_none());

        let (declared, after) = parse_count(&out, at + marker.len()).unwrap();
        assert_eq!(declared, headers.len() + text.len());
        assert_eq!(&out[after..after + 3], b"}\r\n");

        // declared length == actual following bytes
        let literal = &out[after + 3..after + 3 + declared];
        let mut expected = headers.clone();
        expected.extend_from_slice(&text);
        assert_eq!(literal, expected);

        // the response still closes normally after the literal
        assert_eq!(
            &out[after + 3 + declared..],
            b")\r\na005 OK Fetch completed.\r\n"
        );
        assert_eq!(store.counter(keys::IMAP_MSGS), 1);
    }

    #[test]
    fn normal_mode_counts_but_does_not_recombine() {
        let store = Store::in_memory();
        store.set_optimize(false);
        let (unit, _, _) = fetch_response();
        let out = rewrite(Direction::UpstreamToClient, &unit, &store);
        assert_eq!(out, unit);
        assert_eq!(store.counter(keys::IMAP_MSGS), 1);
    }

    #[test]
    fn malformed_literals_fall_back_to_passthrough() {
        let store = Store::in_memory();
        // BODY[TEXT] marker missing: the narrowing reply pattern does
        // not apply, so the response must pass through untouched.
        let unit = b"* 3 FETCH (UID 77 FLAGS (\\Seen) BODY[] {4}\r\nabcd)\r\na005 OK Fetch completed.\r\n";
        let out = rewrite(Direction::UpstreamToClient, unit, &store);
        assert_eq!(out, unit);
        assert_eq!(store.counter(keys::IMAP_MSGS), 1);
    }
}
