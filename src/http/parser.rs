//! HTTP/1.x request parsing.
//!
//! [`parse_http_request`] turns a byte prefix into a [`Request`]. The
//! [`RequestProcessor`] trait is the seam the connection feeds its inbound
//! buffer through; [`Http1Processor`] is the default implementation and adds
//! size limits on top of the raw parser.

use std::collections::HashMap;

use thiserror::Error;

use crate::http::request::{Method, Request};

/// Default cap on the request line plus headers.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

/// Default cap on a request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,
    #[error("header section exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge { length: usize, limit: usize },
    #[error("incomplete request")]
    Incomplete,
}

/// Outcome of feeding a buffer to a [`RequestProcessor`].
#[derive(Debug)]
pub enum Feed {
    /// The buffer holds a prefix of a request; read more bytes.
    Incomplete,
    /// The header section is complete and the whole request occupies
    /// `total` bytes. Feeding again before that many bytes are buffered
    /// returns this same answer, so callers may wait instead.
    AwaitingBody { total: usize },
    /// A full request was found; `consumed` bytes belong to it and anything
    /// after that is the start of the next (pipelined) request.
    Complete { request: Request, consumed: usize },
}

/// Turns accumulated inbound bytes into requests.
///
/// Implementations must not keep the buffer: the connection owns it and
/// drops the consumed prefix after each complete request. Feeding the same
/// prefix twice must give the same answer.
pub trait RequestProcessor: Send + Sync + 'static {
    fn feed(&self, buf: &[u8]) -> Result<Feed, ParseError>;
}

/// The built-in HTTP/1.0 and HTTP/1.1 processor.
#[derive(Debug, Clone)]
pub struct Http1Processor {
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Http1Processor {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
        }
    }
}

impl Default for Http1Processor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_BODY_BYTES)
    }
}

impl RequestProcessor for Http1Processor {
    fn feed(&self, buf: &[u8]) -> Result<Feed, ParseError> {
        match find_headers_end(buf) {
            Some(end) if end + 4 > self.max_header_bytes => {
                return Err(ParseError::HeaderTooLarge {
                    limit: self.max_header_bytes,
                });
            }
            None if buf.len() > self.max_header_bytes => {
                return Err(ParseError::HeaderTooLarge {
                    limit: self.max_header_bytes,
                });
            }
            _ => {}
        }

        match parse_with_limit(buf, self.max_body_bytes) {
            Ok(Parsed::Complete(request, consumed)) => Ok(Feed::Complete { request, consumed }),
            Ok(Parsed::AwaitingBody(total)) => Ok(Feed::AwaitingBody { total }),
            Err(ParseError::Incomplete) => Ok(Feed::Incomplete),
            Err(e) => Err(e),
        }
    }
}

enum Parsed {
    Complete(Request, usize),
    AwaitingBody(usize),
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when `buf` ends before the request does.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    match parse_with_limit(buf, usize::MAX)? {
        Parsed::Complete(request, consumed) => Ok((request, consumed)),
        Parsed::AwaitingBody(_) => Err(ParseError::Incomplete),
    }
}

fn parse_with_limit(buf: &[u8], max_body: usize) -> Result<Parsed, ParseError> {
    // Look for header/body separator
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::InvalidVersion);
    }

    // Headers
    // Names are unique ignoring case: repeats are folded into the first
    // spelling seen, and a repeated Content-Length must agree.
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeader);
        }

        let existing = headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v);
        match existing {
            Some(prev) if key.eq_ignore_ascii_case("Content-Length") => {
                if prev.as_str() != value {
                    return Err(ParseError::InvalidContentLength);
                }
            }
            Some(prev) => {
                prev.push_str(", ");
                prev.push_str(value);
            }
            None => {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    if header("Transfer-Encoding").is_some_and(|v| !v.eq_ignore_ascii_case("identity")) {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    // Body
    let content_length = header("Content-Length")
        .map(|v| v.parse::<usize>().map_err(|_| ParseError::InvalidContentLength))
        .transpose()?
        .unwrap_or(0);

    if content_length > max_body {
        return Err(ParseError::BodyTooLarge {
            length: content_length,
            limit: max_body,
        });
    }

    let total_consumed = (headers_end + 4).saturating_add(content_length);
    if body_bytes.len() < content_length {
        return Ok(Parsed::AwaitingBody(total_consumed));
    }

    let body = body_bytes[..content_length].to_vec();

    let request = Request {
        method,
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body,
    };

    Ok(Parsed::Complete(request, total_consumed))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.target, "/");
        assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn processor_reports_incomplete_prefix() {
        let processor = Http1Processor::default();
        let feed = processor.feed(b"GET / HTTP/1.1\r\nHost: a").unwrap();
        assert!(matches!(feed, Feed::Incomplete));
    }

    #[test]
    fn processor_leaves_pipelined_remainder() {
        let processor = Http1Processor::default();
        let buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        match processor.feed(buf).unwrap() {
            Feed::Complete { request, consumed } => {
                assert_eq!(request.target, "/a");
                assert_eq!(&buf[consumed..], b"GET /b HTTP/1.1\r\n\r\n");
            }
            other => panic!("expected a complete request, got {other:?}"),
        }
    }

    #[test]
    fn processor_reports_body_framing_once_headers_are_in() {
        let processor = Http1Processor::default();
        let buf = b"POST /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        match processor.feed(buf).unwrap() {
            Feed::AwaitingBody { total } => assert_eq!(total, buf.len() - 3 + 10),
            other => panic!("expected body framing, got {other:?}"),
        }
    }

    #[test]
    fn raw_parser_treats_short_body_as_incomplete() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        assert_eq!(parse_http_request(buf).unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn processor_rejects_oversized_headers() {
        let processor = Http1Processor::new(32, 1024);
        let buf = format!("GET / HTTP/1.1\r\nX-Long: {}", "a".repeat(64));
        assert_eq!(
            processor.feed(buf.as_bytes()).unwrap_err(),
            ParseError::HeaderTooLarge { limit: 32 }
        );
    }

    #[test]
    fn processor_rejects_oversized_body() {
        let processor = Http1Processor::new(1024, 4);
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(
            processor.feed(buf).unwrap_err(),
            ParseError::BodyTooLarge { length: 10, limit: 4 }
        );
    }
}
