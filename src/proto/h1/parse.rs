//! The request-line grammar and the header-block grammar, shared between
//! request headers and chunked trailers.
use std::convert::TryFrom;
use std::task::{Context, Poll};

use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::AsyncRead;

use super::io::Pool;
use crate::error::{Error, ParsePosition};

const SP: u8 = b' ';
const HTAB: u8 = b'\t';
const VT: u8 = 0x0b;
const FF: u8 = 0x0c;
const CR: u8 = b'\r';
const LF: u8 = b'\n';

fn is_line_whitespace(b: u8) -> bool {
    matches!(b, SP | HTAB | VT | FF | CR)
}

/// Result of a single byte fed to [`RequestLineParser::step`].
enum RlStep {
    Continue,
    Done(RawRequestLine),
}

pub(crate) struct RawRequestLine {
    pub(crate) method: Method,
    pub(crate) target: Uri,
    pub(crate) version: Version,
}

#[derive(PartialEq)]
enum RlState {
    LeadingWs,
    Method,
    Target,
    Version,
    VersionLf,
}

/// Resumable request-line parser: `METHOD SP target SP HTTP-version
/// CRLF`. Whitespace inside the start-line (SP, HTAB, VT, FF, or a bare CR)
/// is treated as an ordinary separator; consecutive separators collapse.
pub(crate) struct RequestLineParser {
    state: RlState,
    method: Vec<u8>,
    target: Vec<u8>,
    version: Vec<u8>,
    consumed: u64,
    previous_byte: Option<u8>,
    max_size: usize,
}

impl RequestLineParser {
    pub(crate) fn new(max_size: usize) -> Self {
        RequestLineParser {
            state: RlState::Method,
            method: Vec::new(),
            target: Vec::new(),
            version: Vec::new(),
            consumed: 0,
            previous_byte: None,
            max_size,
        }
    }

    pub(crate) fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    fn position(&self, current: Option<u8>) -> ParsePosition {
        ParsePosition {
            previous_byte: self.previous_byte,
            current_byte: current,
            absolute_position: self.consumed,
            bytes_consumed: self.consumed,
        }
    }

    fn err(&self, current: Option<u8>) -> Error {
        Error::new_request_line_parse(self.position(current))
    }

    fn step(&mut self, b: u8) -> Result<RlStep, Error> {
        match self.state {
            RlState::LeadingWs => {
                if is_line_whitespace(b) {
                    return Ok(RlStep::Continue);
                }
                self.state = RlState::Target;
                self.target.push(b);
            }
            RlState::Method => {
                if is_line_whitespace(b) {
                    if self.method.is_empty() {
                        return Err(self.err(Some(b)));
                    }
                    self.state = RlState::LeadingWs;
                } else {
                    self.method.push(b);
                }
            }
            RlState::Target => {
                if is_line_whitespace(b) {
                    if self.target.is_empty() {
                        return Err(self.err(Some(b)));
                    }
                    self.state = RlState::Version;
                } else {
                    self.target.push(b);
                }
            }
            RlState::Version => {
                if b == LF {
                    if self.version.last() == Some(&CR) {
                        self.version.pop();
                    }
                    return self.finish();
                }
                if is_line_whitespace(b) && b != CR {
                    if self.version.is_empty() {
                        // collapsing separator between target and version.
                        return Ok(RlStep::Continue);
                    }
                    // trailing whitespace before CRLF; swallow the rest of
                    // the line.
                    self.state = RlState::VersionLf;
                } else {
                    self.version.push(b);
                }
            }
            RlState::VersionLf => {
                if b == LF {
                    return self.finish();
                }
            }
        }
        Ok(RlStep::Continue)
    }

    fn finish(&mut self) -> Result<RlStep, Error> {
        let method = Method::from_bytes(&self.method)
            .map_err(|_| Error::new_request_line_parse(self.position(None)))?;
        let target = Uri::try_from(&self.target[..])
            .map_err(|_| Error::new_request_line_parse(self.position(None)))?;
        let version = parse_version(&self.version)
            .ok_or_else(|| Error::new_request_line_parse(self.position(None)))?;
        Ok(RlStep::Done(RawRequestLine {
            method,
            target,
            version,
        }))
    }

    pub(crate) fn poll_parse<T: AsyncRead + Unpin>(
        &mut self,
        pool: &mut Pool<T>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<RawRequestLine, Error>> {
        loop {
            let b = match ready!(pool.poll_read_byte(cx)) {
                Ok(Some(b)) => b,
                Ok(None) => return Poll::Ready(Err(Error::new_end_of_stream())),
                Err(e) => return Poll::Ready(Err(Error::from(e))),
            };
            self.consumed += 1;
            if self.consumed as usize > self.max_size {
                return Poll::Ready(Err(Error::new_head_size_exceeded(self.max_size)));
            }
            let outcome = self.step(b)?;
            self.previous_byte = Some(b);
            if let RlStep::Done(line) = outcome {
                return Poll::Ready(Ok(line));
            }
        }
    }
}

fn parse_version(raw: &[u8]) -> Option<Version> {
    match raw {
        b"HTTP/1.1" => Some(Version::HTTP_11),
        b"HTTP/1.0" => Some(Version::HTTP_10),
        b"HTTP/0.9" => Some(Version::HTTP_09),
        _ => None,
    }
}

/// Resumable boundary detector for a header (or trailer) block: accumulates
/// raw bytes, tracking line-start state so it can recognize the blank-line
/// terminator, then hands the complete block (terminator included) to
/// [`parse_header_block`]. The grammar itself (name/value/obs-fold/trim)
/// doesn't need to be resumable since it only runs once the whole block is
/// in hand.
pub(crate) struct HeaderBlockReader {
    buf: Vec<u8>,
    at_line_start: bool,
    after_cr_at_line_start: bool,
    consumed: u64,
    previous_byte: Option<u8>,
    max_size: usize,
}

impl HeaderBlockReader {
    pub(crate) fn new(max_size: usize, already_consumed: u64) -> Self {
        HeaderBlockReader {
            buf: Vec::new(),
            at_line_start: true,
            after_cr_at_line_start: false,
            consumed: already_consumed,
            previous_byte: None,
            max_size,
        }
    }

    fn position(&self, current: Option<u8>) -> ParsePosition {
        ParsePosition {
            previous_byte: self.previous_byte,
            current_byte: current,
            absolute_position: self.consumed,
            bytes_consumed: self.consumed,
        }
    }

    /// Feeds one byte; returns `true` once the blank-line terminator has
    /// been consumed and the block is complete.
    fn step(&mut self, b: u8) -> Result<bool, Error> {
        self.buf.push(b);
        if self.after_cr_at_line_start {
            self.after_cr_at_line_start = false;
            if b == LF {
                return Ok(true);
            }
            return Err(Error::new_header_parse(self.position(Some(b))));
        }
        if self.at_line_start {
            if b == CR {
                self.after_cr_at_line_start = true;
                self.at_line_start = false;
                return Ok(false);
            }
            if b == LF {
                // bare LF blank line
                return Ok(true);
            }
            self.at_line_start = false;
            return Ok(false);
        }
        if b == LF {
            self.at_line_start = true;
        }
        Ok(false)
    }

    pub(crate) fn poll_parse<T: AsyncRead + Unpin>(
        &mut self,
        pool: &mut Pool<T>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<HeaderMap, Error>> {
        loop {
            let b = match ready!(pool.poll_read_byte(cx)) {
                Ok(Some(b)) => b,
                Ok(None) => return Poll::Ready(Err(Error::new_end_of_stream())),
                Err(e) => return Poll::Ready(Err(Error::from(e))),
            };
            self.consumed += 1;
            if self.consumed as usize > self.max_size {
                return Poll::Ready(Err(Error::new_head_size_exceeded(self.max_size)));
            }
            let done = self.step(b)?;
            self.previous_byte = Some(b);
            if done {
                let position = self.position(None);
                return Poll::Ready(
                    parse_header_block(&self.buf).map_err(|_| Error::new_header_parse(position)),
                );
            }
        }
    }
}

/// Parses a complete header (or trailer) block: lines of `name: value`
/// terminated by CRLF or a lenient bare LF, ending at a blank line. Leading
/// whitespace on a continuation line folds it onto the previous header's
/// value (obsolete line folding); whitespace inside a field name is
/// rejected. Duplicate names are preserved as repeated entries.
pub(crate) fn parse_header_block(buf: &[u8]) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let mut last_name: Option<HeaderName> = None;

    let mut lines = buf.split(|&b| b == LF);
    for raw_line in &mut lines {
        let line = strip_trailing_cr(raw_line);
        if line.is_empty() {
            break;
        }
        if line[0] == SP || line[0] == HTAB {
            let trimmed = trim_ows(line);
            let name = last_name.clone().ok_or_else(Error::new_framing_mismatch)?;
            if !trimmed.is_empty() {
                let existing = headers
                    .get(&name)
                    .map(|v| v.as_bytes().to_vec())
                    .unwrap_or_default();
                let mut joined = existing;
                if !joined.is_empty() && joined.last() != Some(&SP) {
                    joined.push(SP);
                }
                joined.extend_from_slice(trimmed);
                let value =
                    HeaderValue::from_bytes(&joined).map_err(|_| Error::new_framing_mismatch())?;
                headers.insert(name, value);
            }
            continue;
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(Error::new_framing_mismatch)?;
        let name_bytes = &line[..colon];
        if name_bytes.iter().any(|&b| is_line_whitespace(b)) {
            return Err(Error::new_framing_mismatch());
        }
        let name = HeaderName::from_bytes(name_bytes).map_err(|_| Error::new_framing_mismatch())?;
        let value_bytes = trim_ows(&line[colon + 1..]);
        let value =
            HeaderValue::from_bytes(value_bytes).map_err(|_| Error::new_framing_mismatch())?;
        headers.append(&name, value);
        last_name = Some(name);
    }

    Ok(headers)
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&CR) {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != SP && b != HTAB)
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != SP && b != HTAB)
        .map(|i| i + 1)
        .unwrap_or(0);
    if start >= end {
        &[]
    } else {
        &bytes[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    async fn parse_request_line(data: &[u8]) -> Result<(String, String, Version), Error> {
        let mut pool = Pool::new(data);
        let mut parser = RequestLineParser::new(8192);
        let line = poll_fn(|cx| parser.poll_parse(&mut pool, cx)).await?;
        Ok((
            line.method.to_string(),
            line.target.to_string(),
            line.version,
        ))
    }

    #[tokio::test]
    async fn parses_ordinary_request_line() {
        let (method, target, version) = parse_request_line(b"GET /foo HTTP/1.1\r\n")
            .await
            .unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "/foo");
        assert_eq!(version, Version::HTTP_11);
    }

    #[tokio::test]
    async fn accepts_bare_lf_terminator() {
        let (method, target, version) = parse_request_line(b"GET / HTTP/1.1\n").await.unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "/");
        assert_eq!(version, Version::HTTP_11);
    }

    #[tokio::test]
    async fn collapses_extra_whitespace_between_tokens() {
        let (method, target, _version) = parse_request_line(b"GET  /foo  HTTP/1.1\r\n")
            .await
            .unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "/foo");
    }

    #[tokio::test]
    async fn rejects_empty_method() {
        assert!(parse_request_line(b" / HTTP/1.1\r\n").await.is_err());
    }

    #[tokio::test]
    async fn enforces_size_cap() {
        let mut pool = Pool::new(&b"GET /a-rather-long-path HTTP/1.1\r\n"[..]);
        let mut parser = RequestLineParser::new(4);
        let result = poll_fn(|cx| parser.poll_parse(&mut pool, cx)).await;
        assert!(result.is_err());
    }

    fn parse_block_sync(data: &'static [u8]) -> HeaderMap {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async move {
                let mut pool = Pool::new(data);
                let mut reader = HeaderBlockReader::new(1024 * 64, 0);
                poll_fn(|cx| reader.poll_parse(&mut pool, cx)).await.unwrap()
            })
    }

    #[test]
    fn parses_simple_headers() {
        let headers = parse_block_sync(b"Host: example.com\r\nX-Foo: bar\r\n\r\n");
        assert_eq!(headers.get("host").unwrap(), "example.com");
        assert_eq!(headers.get("x-foo").unwrap(), "bar");
    }

    #[test]
    fn preserves_duplicate_header_names() {
        let headers = parse_block_sync(b"X-Foo: a\r\nX-Foo: b\r\n\r\n");
        let values: Vec<_> = headers.get_all("x-foo").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn folds_obsolete_continuation_lines() {
        let headers = parse_block_sync(b"X-Foo: a\r\n b\r\n\r\n");
        assert_eq!(headers.get("x-foo").unwrap(), "a b");
    }

    #[test]
    fn allows_empty_values() {
        let headers = parse_block_sync(b"X-Empty:\r\n\r\n");
        assert_eq!(headers.get("x-empty").unwrap(), "");
    }

    #[test]
    fn rejects_whitespace_in_field_name() {
        let err = parse_header_block(b"X Foo: bar\r\n\r\n");
        assert!(err.is_err());
    }

    #[test]
    fn bare_lf_terminates_block() {
        let headers = parse_block_sync(b"Host: example.com\n\n");
        assert_eq!(headers.get("host").unwrap(), "example.com");
    }
}
