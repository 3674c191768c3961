//! Inline metadata sentinel tokenizer
//!
//! Chunk content may embed structured metadata as
//! `<<<METADATA:<TYPE>:<JSON>>>>`. The payload boundary is found by parsing
//! exactly one JSON value and requiring the closing delimiter right after it,
//! so `>>>` inside JSON strings never terminates a sentinel early. Anything
//! that looks like a sentinel but fails to parse stays literal text.

/// Opening delimiter, including the type separator
pub const SENTINEL_OPEN: &str = "<<<METADATA:";

/// Closing delimiter
pub const SENTINEL_CLOSE: &str = ">>>";

/// A piece of chunk content
#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    /// Visible text, verbatim
    Text(&'a str),
    /// Well-formed sentinel; `kind` is the raw type token
    Metadata {
        kind: &'a str,
        payload: serde_json::Value,
    },
}

/// Split chunk content into ordered text and metadata segments
pub fn split(content: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(offset) = content[cursor..].find(SENTINEL_OPEN) {
        let open_at = cursor + offset;
        match parse_sentinel(&content[open_at..]) {
            Some((kind, payload, len)) => {
                if open_at > text_start {
                    segments.push(Segment::Text(&content[text_start..open_at]));
                }
                segments.push(Segment::Metadata { kind, payload });
                cursor = open_at + len;
                text_start = cursor;
            }
            None => {
                tracing::debug!(offset = open_at, "Malformed metadata sentinel kept as text");
                cursor = open_at + SENTINEL_OPEN.len();
            }
        }
    }

    if text_start < content.len() {
        segments.push(Segment::Text(&content[text_start..]));
    }

    segments
}

/// Parse a sentinel at the start of `input`.
///
/// Returns the type token, the payload, and the byte length consumed.
fn parse_sentinel(input: &str) -> Option<(&str, serde_json::Value, usize)> {
    let rest = input.strip_prefix(SENTINEL_OPEN)?;

    let colon = rest.find(':')?;
    let kind = &rest[..colon];
    if !is_type_token(kind) {
        return None;
    }

    let json_src = &rest[colon + 1..];
    let mut values = serde_json::Deserializer::from_str(json_src).into_iter::<serde_json::Value>();
    let payload = match values.next() {
        Some(Ok(value)) => value,
        _ => return None,
    };
    let consumed = values.byte_offset();

    if !json_src[consumed..].starts_with(SENTINEL_CLOSE) {
        return None;
    }

    let len = SENTINEL_OPEN.len() + colon + 1 + consumed + SENTINEL_CLOSE.len();
    Some((kind, payload, len))
}

fn is_type_token(kind: &str) -> bool {
    !kind.is_empty()
        && kind
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}
