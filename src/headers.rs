//! Structured view of an RFC 5322 header block
//!
//! Outgoing-mail rewrites need to drop whole header lines (folded
//! continuations included) and rework the `To:` value without ever
//! touching the body bytes. Rather than pattern-matching on the raw
//! unit, the block is parsed into an ordered list of entries, edited,
//! and reserialized; an untouched block reserializes byte-exact.
//!
//! Parsing is deliberately forgiving: a line with no colon becomes an
//! opaque entry that never matches a name, so malformed input passes
//! through unchanged instead of failing the rewrite.

use memchr::memmem;

const CRLF: &[u8] = b"\r\n";

/// One header entry: the full raw line including any folded
/// continuation lines and the trailing CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    raw: Vec<u8>,
}

impl Entry {
    /// The header name, if the first line has one.
    fn name(&self) -> Option<&[u8]> {
        let colon = memchr::memchr(b':', &self.raw)?;
        let line_end = memmem::find(&self.raw, CRLF).unwrap_or(self.raw.len());
        if colon > line_end {
            return None;
        }
        Some(&self.raw[..colon])
    }

    fn is(&self, name: &str) -> bool {
        self.name()
            .is_some_and(|n| n.eq_ignore_ascii_case(name.as_bytes()))
    }
}

/// An ordered header block plus the untouched body that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<Entry>,
    body: Vec<u8>,
}

impl HeaderBlock {
    /// Split `unit` at the first empty line into header entries and
    /// body. Returns `None` when there is no CRLFCRLF boundary, i.e.
    /// the unit is not a headers-plus-body message.
    #[must_use]
    pub fn parse(unit: &[u8]) -> Option<Self> {
        let boundary = memmem::find(unit, b"\r\n\r\n")?;
        let header_bytes = &unit[..boundary + 2];
        let body = unit[boundary + 4..].to_vec();

        let mut entries: Vec<Entry> = Vec::new();
        let mut start = 0;
        while start < header_bytes.len() {
            let rel = memmem::find(&header_bytes[start..], CRLF)
                .map_or(header_bytes.len() - start, |i| i + 2);
            let line = &header_bytes[start..start + rel];
            let continuation = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
            match entries.last_mut() {
                Some(last) if continuation => last.raw.extend_from_slice(line),
                _ => entries.push(Entry { raw: line.to_vec() }),
            }
            start += rel;
        }

        Some(Self { entries, body })
    }

    /// Remove at most one entry named `name` (ASCII case-insensitive),
    /// folded continuations included. Returns whether one was removed.
    pub fn strip_first(&mut self, name: &str) -> bool {
        if let Some(idx) = self.entries.iter().position(|e| e.is(name)) {
            self.entries.remove(idx);
            return true;
        }
        false
    }

    /// Rewrite the `To:` entry: each comma-separated address in the
    /// display-name form `Name <addr>` becomes just `addr`; addresses
    /// are rejoined with `, \r\n\t` so the header stays folded.
    pub fn rewrite_to(&mut self) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.is("To")) else {
            return;
        };
        let Some(colon) = memchr::memchr(b':', &entry.raw) else {
            return;
        };

        let value = unfold(&entry.raw[colon + 1..]);
        let mut raw = b"To: ".to_vec();
        for (i, part) in value.split(|b| *b == b',').enumerate() {
            if i > 0 {
                raw.extend_from_slice(b", \r\n\t");
            }
            raw.extend_from_slice(bare_address(part));
        }
        raw.extend_from_slice(CRLF);
        entry.raw = raw;
    }

    /// Reserialize: entries in order, the blank line, then the body.
    #[must_use]
    pub fn unparse(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.entries.iter().map(|e| e.raw.len()).sum::<usize>() + 2 + self.body.len(),
        );
        for entry in &self.entries {
            out.extend_from_slice(&entry.raw);
        }
        out.extend_from_slice(CRLF);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Collapse folded continuation lines into single spaces and trim.
fn unfold(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for byte in value {
        match byte {
            b'\r' | b'\n' => {}
            b'\t' => out.push(b' '),
            b => out.push(*b),
        }
    }
    out.trim_ascii().to_vec()
}

/// `Name <addr>` -> `addr`; anything else is returned trimmed.
fn bare_address(part: &[u8]) -> &[u8] {
    let part = part.trim_ascii();
    if let (Some(open), Some(close)) = (memchr::memrchr(b'<', part), memchr::memrchr(b'>', part))
        && open < close
    {
        return &part[open + 1..close];
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = b"From: alice@example.com\r\n\
        To: Bob <bob@example.com>\r\n\
        Subject: a very\r\n\
        \tlong subject line\r\n\
        X-Mailer: TestMailer 1.0\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Hello\r\nbody lines\r\n";

    #[test]
    fn untouched_block_reserializes_byte_exact() {
        let block = HeaderBlock::parse(MESSAGE).unwrap();
        assert_eq!(block.unparse(), MESSAGE);
    }

    #[test]
    fn parse_requires_blank_line() {
        assert!(HeaderBlock::parse(b"From: a@b.c\r\nTo: d@e.f\r\n").is_none());
    }

    #[test]
    fn strip_removes_folded_entry_once() {
        let mut block = HeaderBlock::parse(MESSAGE).unwrap();
        assert!(block.strip_first("Subject"));
        let out = block.unparse();
        assert!(!out.windows(8).any(|w| w == b"Subject:"));
        assert!(!out.windows(4).any(|w| w == b"long"));
        // body untouched
        assert!(out.ends_with(b"\r\n\r\nHello\r\nbody lines\r\n"));
        // second strip is a no-op
        assert!(!block.strip_first("Subject"));
    }

    #[test]
    fn strip_is_case_insensitive_on_the_name() {
        let mut block = HeaderBlock::parse(MESSAGE).unwrap();
        assert!(block.strip_first("x-mailer"));
    }

    #[test]
    fn strip_missing_header_leaves_block_unchanged() {
        let mut block = HeaderBlock::parse(MESSAGE).unwrap();
        assert!(!block.strip_first("Autocrypt"));
        assert_eq!(block.unparse(), MESSAGE);
    }

    #[test]
    fn rewrite_to_drops_display_names() {
        let mut block = HeaderBlock::parse(MESSAGE).unwrap();
        block.rewrite_to();
        let out = block.unparse();
        assert!(out.windows(22).any(|w| w == b"To: bob@example.com\r\nS"));
    }

    #[test]
    fn rewrite_to_folds_multiple_addresses() {
        let raw = b"To: Bob <bob@example.com>, carol@example.com,\r\n\
            \tDan Smith <dan@example.com>\r\n\
            \r\n\
            body";
        let mut block = HeaderBlock::parse(raw).unwrap();
        block.rewrite_to();
        let out = block.unparse();
        let expected =
            b"To: bob@example.com, \r\n\tcarol@example.com, \r\n\tdan@example.com\r\n\r\nbody";
        assert_eq!(out, expected);
    }

    #[test]
    fn body_with_colon_lines_is_not_parsed_as_headers() {
        let raw = b"Subject: hi\r\n\r\nkey: value in the body\r\n";
        let mut block = HeaderBlock::parse(raw).unwrap();
        assert!(!block.strip_first("key"));
        assert!(block.strip_first("Subject"));
        assert_eq!(block.unparse(), b"\r\nkey: value in the body\r\n");
    }
}
