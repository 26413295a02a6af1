//! MIME multipart reader for local block reads.
//!
//! A local `readImageBlock` reply is a `multipart/mixed` body with two
//! parts: the JSON session response (including block metadata) and the raw
//! block bytes. Scanners pad the binary part, so a part carrying a
//! `Content-Length` header is cut to exactly that many bytes and anything
//! after it, up to the next boundary, is discarded.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Extracts the boundary parameter from a `Content-Type` header.
static BOUNDARY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)boundary\s*=\s*(?:"([^"]+)"|([^;\s]+))"#).expect("literal boundary pattern")
});

// ============================================================================
// Part
// ============================================================================

/// One part of a multipart body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    /// Part headers (lowercase keys).
    pub headers: Vec<(String, String)>,

    /// Part body.
    pub body: Vec<u8>,

    /// The declared `Content-Length` exceeded the bytes available.
    pub truncated: bool,
}

impl Part {
    /// Look up a part header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k == &lower)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if the part's content type starts with `prefix`.
    #[must_use]
    pub fn is_content_type(&self, prefix: &str) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.trim().to_lowercase().starts_with(prefix))
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Extracts the boundary from a `Content-Type` header value.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the header carries no boundary.
pub fn boundary(content_type: &str) -> Result<String> {
    BOUNDARY_PATTERN
        .captures(content_type)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| Error::protocol(format!("No multipart boundary in '{content_type}'")))
}

/// Splits a multipart body into its parts.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the opening boundary or a part's header
/// block is missing.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}").into_bytes();

    let mut cursor = find(body, &delimiter, 0)
        .ok_or_else(|| Error::protocol("Multipart body has no opening boundary"))?;
    let mut parts = Vec::new();

    loop {
        cursor += delimiter.len();

        // Closing delimiter.
        if body[cursor..].starts_with(b"--") {
            break;
        }
        cursor = skip_line_break(body, cursor);
        if cursor >= body.len() {
            break;
        }

        let (headers, body_start) = read_headers(body, cursor)?;
        let declared = content_length(&headers);

        let (content, truncated, next) = match declared {
            Some(len) => {
                let end = body_start.saturating_add(len);
                if end > body.len() {
                    (body[body_start..].to_vec(), true, None)
                } else {
                    let next = find(body, &delimiter, end);
                    (body[body_start..end].to_vec(), false, next)
                }
            }
            None => match find(body, &delimiter, body_start) {
                Some(next) => {
                    let end = trim_line_break(body, body_start, next);
                    (body[body_start..end].to_vec(), false, Some(next))
                }
                None => {
                    let end = trim_line_break(body, body_start, body.len());
                    (body[body_start..end].to_vec(), false, None)
                }
            },
        };

        parts.push(Part {
            headers,
            body: content,
            truncated,
        });

        match next {
            Some(next) => cursor = next,
            None => break,
        }
    }

    Ok(parts)
}

// ============================================================================
// Helpers
// ============================================================================

/// Finds `needle` in `haystack` at or after `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Skips one CRLF or LF at `pos`.
fn skip_line_break(body: &[u8], pos: usize) -> usize {
    if body[pos..].starts_with(b"\r\n") {
        pos + 2
    } else if body[pos..].starts_with(b"\n") {
        pos + 1
    } else {
        pos
    }
}

/// Drops the line break that precedes a boundary.
fn trim_line_break(body: &[u8], start: usize, end: usize) -> usize {
    if end >= start + 2 && &body[end - 2..end] == b"\r\n" {
        end - 2
    } else if end > start && body[end - 1] == b'\n' {
        end - 1
    } else {
        end
    }
}

/// Reads the header block of a part starting at `pos`.
///
/// Returns the headers and the offset of the first body byte.
fn read_headers(body: &[u8], mut pos: usize) -> Result<(Vec<(String, String)>, usize)> {
    let mut headers = Vec::new();

    loop {
        let line_end = find(body, b"\n", pos)
            .ok_or_else(|| Error::protocol("Multipart part has no header terminator"))?;
        let line = &body[pos..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        pos = line_end + 1;

        if line.is_empty() {
            return Ok((headers, pos));
        }

        let text = String::from_utf8_lossy(line);
        if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse().ok())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn block_body(binary: &[u8], declared: usize, padding: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZ\r\n");
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n");
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(br#"{"results":{"success":true}}"#);
        body.extend_from_slice(b"\r\n--XYZ\r\n");
        body.extend_from_slice(b"Content-Type: application/pdf\r\n");
        body.extend_from_slice(format!("Content-Length: {declared}\r\n").as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(binary);
        body.extend_from_slice(padding);
        body.extend_from_slice(b"\r\n--XYZ--\r\n");
        body
    }

    #[test]
    fn test_boundary_quoted_and_bare() {
        assert_eq!(
            boundary("multipart/mixed; boundary=\"abc 123\"").expect("boundary"),
            "abc 123"
        );
        assert_eq!(
            boundary("multipart/mixed; charset=UTF-8; BOUNDARY=xyz").expect("boundary"),
            "xyz"
        );
        assert!(boundary("application/json").is_err());
    }

    #[test]
    fn test_parse_json_and_binary() {
        let body = block_body(b"%PDF-1.4 data", 13, b"");
        let parts = parse(&body, "XYZ").expect("parse");

        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_content_type("application/json"));
        assert_eq!(parts[0].body, br#"{"results":{"success":true}}"#);
        assert!(parts[1].is_content_type("application/pdf"));
        assert_eq!(parts[1].body, b"%PDF-1.4 data");
        assert!(!parts[1].truncated);
    }

    #[test]
    fn test_content_length_discards_trailing_bytes() {
        let body = block_body(b"\x00\x01\r\n\x02", 5, b"\r\n\r\ngarbage");
        let parts = parse(&body, "XYZ").expect("parse");

        assert_eq!(parts[1].body, b"\x00\x01\r\n\x02");
    }

    #[test]
    fn test_truncated_binary_part() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--XYZ\r\nContent-Type: application/pdf\r\n");
        body.extend_from_slice(b"Content-Length: 100\r\n\r\nshort");

        let parts = parse(&body, "XYZ").expect("parse");
        assert_eq!(parts.len(), 1);
        assert!(parts[0].truncated);
        assert_eq!(parts[0].body, b"short");
    }

    #[test]
    fn test_missing_opening_boundary() {
        assert!(parse(b"no parts here", "XYZ").is_err());
    }
}
