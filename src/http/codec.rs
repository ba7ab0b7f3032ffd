//! HTTP/1.0 and HTTP/1.1 wire codec.
//!
//! [`RequestDecoder`] accumulates raw socket bytes and yields complete
//! requests (request line + headers + body, with `Content-Length` and
//! chunked transfer framing). [`encode_response`] serializes a response,
//! adding `Content-Length` and the connection-management header.
//!
//! Per RFC 7230 §3.3.3, a request carrying both `Content-Length` and
//! `Transfer-Encoding` is rejected outright as a smuggling vector, as are
//! duplicate copies of either header.

use super::types::{default_reason, Method, Response, Version};
use bytes::BytesMut;

/// Maximum number of headers accepted per request.
const MAX_HEADERS: usize = 128;

/// Maximum accepted request-line length.
const MAX_REQUEST_LINE: usize = 8192;

/// Maximum accepted chunk-size line length.
const MAX_CHUNK_LINE: usize = 1024;

/// Protocol-level decode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The request line is malformed.
    #[error("malformed request line")]
    BadRequestLine,
    /// Unrecognised HTTP method.
    #[error("unrecognised HTTP method")]
    BadMethod,
    /// Unsupported HTTP version in request.
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    /// A header line is malformed.
    #[error("malformed header")]
    BadHeader,
    /// Content-Length is not a valid integer, or duplicated.
    #[error("invalid Content-Length")]
    BadContentLength,
    /// Transfer-Encoding present but unsupported, or duplicated.
    #[error("unsupported Transfer-Encoding")]
    BadTransferEncoding,
    /// Both Content-Length and Transfer-Encoding present.
    #[error("ambiguous body length")]
    AmbiguousBodyLength,
    /// Malformed chunked transfer encoding.
    #[error("malformed chunked encoding")]
    BadChunk,
    /// Too many headers.
    #[error("too many headers")]
    TooManyHeaders,
    /// Request line exceeds the line limit.
    #[error("request line too long")]
    RequestLineTooLong,
    /// Header block exceeds the configured limit.
    #[error("header block too large")]
    HeadersTooLarge,
    /// Body exceeds the configured limit.
    #[error("body exceeds size limit")]
    BodyTooLarge,
}

impl DecodeError {
    /// The HTTP status the server replies with for this failure.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::HeadersTooLarge | Self::RequestLineTooLong | Self::TooManyHeaders => 431,
            Self::BodyTooLarge => 413,
            Self::UnsupportedVersion => 505,
            _ => 400,
        }
    }
}

/// A fully decoded request, before the server wraps it for dispatch.
#[derive(Debug)]
pub struct DecodedRequest {
    /// HTTP method.
    pub method: Method,
    /// Request URI (e.g. `/path?query`).
    pub uri: String,
    /// HTTP version.
    pub version: Version,
    /// Headers as name-value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes, bounded by the decoder's body limit.
    pub body: Vec<u8>,
}

enum BodyKind {
    ContentLength(usize),
    Chunked,
}

enum DecodeState {
    Head,
    Body {
        method: Method,
        uri: String,
        version: Version,
        headers: Vec<(String, String)>,
        remaining: usize,
    },
    Chunked {
        method: Method,
        uri: String,
        version: Version,
        headers: Vec<(String, String)>,
        chunked: ChunkedDecoder,
    },
}

/// Incremental HTTP request decoder with size caps.
pub struct RequestDecoder {
    buf: BytesMut,
    state: DecodeState,
    max_header_size: usize,
    max_body_size: usize,
}

impl RequestDecoder {
    /// Creates a decoder with the given header-block and body byte caps.
    #[must_use]
    pub fn new(max_header_size: usize, max_body_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::Head,
            max_header_size,
            max_body_size,
        }
    }

    /// Appends raw bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns true once the current request's header block is complete and
    /// body bytes are being consumed.
    #[must_use]
    pub fn is_in_body(&self) -> bool {
        !matches!(self.state, DecodeState::Head)
    }

    /// Returns true if undecoded bytes are buffered (e.g. a pipelined
    /// request behind the one just returned).
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Attempts to decode one complete request from the buffered bytes.
    ///
    /// # Errors
    ///
    /// Fails on malformed or over-limit input; the connection replies with
    /// [`DecodeError::status`] and closes.
    pub fn poll(&mut self) -> Result<Option<DecodedRequest>, DecodeError> {
        loop {
            match &mut self.state {
                state @ DecodeState::Head => {
                    let Some((method, uri, version, headers, kind)) =
                        decode_head(&mut self.buf, self.max_header_size)?
                    else {
                        return Ok(None);
                    };
                    match kind {
                        BodyKind::ContentLength(0) => {
                            return Ok(Some(DecodedRequest {
                                method,
                                uri,
                                version,
                                headers,
                                body: Vec::new(),
                            }));
                        }
                        BodyKind::ContentLength(len) => {
                            if len > self.max_body_size {
                                return Err(DecodeError::BodyTooLarge);
                            }
                            *state = DecodeState::Body {
                                method,
                                uri,
                                version,
                                headers,
                                remaining: len,
                            };
                        }
                        BodyKind::Chunked => {
                            *state = DecodeState::Chunked {
                                method,
                                uri,
                                version,
                                headers,
                                chunked: ChunkedDecoder::new(self.max_body_size),
                            };
                        }
                    }
                }

                DecodeState::Body { remaining, .. } => {
                    if self.buf.len() < *remaining {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(*remaining).to_vec();
                    let (method, uri, version, headers) =
                        take_head(std::mem::replace(&mut self.state, DecodeState::Head));
                    return Ok(Some(DecodedRequest {
                        method,
                        uri,
                        version,
                        headers,
                        body,
                    }));
                }

                DecodeState::Chunked { chunked, .. } => {
                    let Some(body) = chunked.decode(&mut self.buf)? else {
                        return Ok(None);
                    };
                    let (method, uri, version, headers) =
                        take_head(std::mem::replace(&mut self.state, DecodeState::Head));
                    return Ok(Some(DecodedRequest {
                        method,
                        uri,
                        version,
                        headers,
                        body,
                    }));
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDecoder")
            .field("buffered", &self.buf.len())
            .field("in_body", &self.is_in_body())
            .finish()
    }
}

fn take_head(state: DecodeState) -> (Method, String, Version, Vec<(String, String)>) {
    match state {
        DecodeState::Body {
            method,
            uri,
            version,
            headers,
            ..
        }
        | DecodeState::Chunked {
            method,
            uri,
            version,
            headers,
            ..
        } => (method, uri, version, headers),
        DecodeState::Head => unreachable!("take_head called in Head state"),
    }
}

/// Find the index just past `\r\n\r\n` in `buf`.
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[allow(clippy::type_complexity)]
fn decode_head(
    src: &mut BytesMut,
    max_header_size: usize,
) -> Result<Option<(Method, String, Version, Vec<(String, String)>, BodyKind)>, DecodeError> {
    if let Some(line_end) = src.as_ref().windows(2).position(|w| w == b"\r\n") {
        if line_end > MAX_REQUEST_LINE {
            return Err(DecodeError::RequestLineTooLong);
        }
    }

    let Some(end) = find_headers_end(src.as_ref()) else {
        if src.len() > max_header_size {
            return Err(DecodeError::HeadersTooLarge);
        }
        return Ok(None);
    };
    if end > max_header_size {
        return Err(DecodeError::HeadersTooLarge);
    }

    let head_bytes = src.split_to(end);
    let head_str =
        std::str::from_utf8(head_bytes.as_ref()).map_err(|_| DecodeError::BadRequestLine)?;

    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().ok_or(DecodeError::BadRequestLine)?;
    let (method, uri, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        headers.push(parse_header_line(line)?);
        if headers.len() > MAX_HEADERS {
            return Err(DecodeError::TooManyHeaders);
        }
    }

    let kind = body_kind(version, &headers)?;
    Ok(Some((method, uri, version, headers, kind)))
}

/// Parse the request line: `METHOD SP URI SP VERSION`.
fn parse_request_line(line: &str) -> Result<(Method, String, Version), DecodeError> {
    let mut parts = line.split_ascii_whitespace();
    let method_str = parts.next().ok_or(DecodeError::BadRequestLine)?;
    let uri = parts.next().ok_or(DecodeError::BadRequestLine)?;
    let version_str = parts.next().ok_or(DecodeError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(DecodeError::BadRequestLine);
    }

    let method = Method::from_bytes(method_str.as_bytes()).ok_or(DecodeError::BadMethod)?;
    let version =
        Version::from_bytes(version_str.as_bytes()).ok_or(DecodeError::UnsupportedVersion)?;
    Ok((method, uri.to_owned(), version))
}

/// Validates an HTTP field-name (RFC 7230 tchar set).
fn is_valid_header_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.as_bytes().iter().all(|&b| {
        matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
        )
    })
}

/// Parse a single `Name: Value` header line.
fn parse_header_line(line: &str) -> Result<(String, String), DecodeError> {
    let colon = line.find(':').ok_or(DecodeError::BadHeader)?;
    let raw_name = &line[..colon];
    let name = raw_name.trim();
    if raw_name != name || !is_valid_header_name(name) {
        return Err(DecodeError::BadHeader);
    }
    let value = line[colon + 1..].trim().to_owned();
    Ok((name.to_owned(), value))
}

/// Look up a header value, rejecting duplicates.
fn unique_header_value<'a>(
    headers: &'a [(String, String)],
    name: &str,
    dup: DecodeError,
) -> Result<Option<&'a str>, DecodeError> {
    let mut found = None;
    for (n, v) in headers {
        if n.eq_ignore_ascii_case(name) {
            if found.is_some() {
                return Err(dup);
            }
            found = Some(v.as_str());
        }
    }
    Ok(found)
}

fn body_kind(version: Version, headers: &[(String, String)]) -> Result<BodyKind, DecodeError> {
    let te = unique_header_value(headers, "Transfer-Encoding", DecodeError::BadTransferEncoding)?;
    let cl = unique_header_value(headers, "Content-Length", DecodeError::BadContentLength)?;

    if te.is_some() && cl.is_some() {
        return Err(DecodeError::AmbiguousBodyLength);
    }
    if let Some(te) = te {
        if version == Version::Http10 || !te.trim().eq_ignore_ascii_case("chunked") {
            return Err(DecodeError::BadTransferEncoding);
        }
        return Ok(BodyKind::Chunked);
    }
    if let Some(cl) = cl {
        let len: usize = cl.trim().parse().map_err(|_| DecodeError::BadContentLength)?;
        return Ok(BodyKind::ContentLength(len));
    }
    Ok(BodyKind::ContentLength(0))
}

enum ChunkPhase {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

/// Chunked transfer-encoding body decoder. Trailer fields are consumed and
/// discarded.
struct ChunkedDecoder {
    phase: ChunkPhase,
    body: Vec<u8>,
    max_body_size: usize,
}

impl ChunkedDecoder {
    fn new(max_body_size: usize) -> Self {
        Self {
            phase: ChunkPhase::SizeLine,
            body: Vec::new(),
            max_body_size,
        }
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, DecodeError> {
        loop {
            match self.phase {
                ChunkPhase::SizeLine => {
                    let Some(line) = split_line_crlf(src, MAX_CHUNK_LINE)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(line.as_ref())?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailers;
                        continue;
                    }
                    if self.body.len().saturating_add(size) > self.max_body_size {
                        return Err(DecodeError::BodyTooLarge);
                    }
                    self.phase = ChunkPhase::Data { remaining: size };
                }
                ChunkPhase::Data { remaining } => {
                    if src.len() < remaining {
                        return Ok(None);
                    }
                    let data = src.split_to(remaining);
                    self.body.extend_from_slice(data.as_ref());
                    self.phase = ChunkPhase::DataCrlf;
                }
                ChunkPhase::DataCrlf => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src.as_ref()[..2] != b"\r\n" {
                        return Err(DecodeError::BadChunk);
                    }
                    let _ = src.split_to(2);
                    self.phase = ChunkPhase::SizeLine;
                }
                ChunkPhase::Trailers => {
                    let Some(line) = split_line_crlf(src, MAX_CHUNK_LINE)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.phase = ChunkPhase::SizeLine;
                        return Ok(Some(std::mem::take(&mut self.body)));
                    }
                    // Validate, then drop: trailers are not surfaced.
                    let line =
                        std::str::from_utf8(line.as_ref()).map_err(|_| DecodeError::BadHeader)?;
                    let _ = parse_header_line(line)?;
                }
            }
        }
    }
}

fn split_line_crlf(src: &mut BytesMut, max_len: usize) -> Result<Option<BytesMut>, DecodeError> {
    let Some(line_end) = src.as_ref().windows(2).position(|w| w == b"\r\n") else {
        if src.len() > max_len {
            return Err(DecodeError::BadChunk);
        }
        return Ok(None);
    };
    if line_end > max_len {
        return Err(DecodeError::BadChunk);
    }
    let line = src.split_to(line_end);
    let _ = src.split_to(2);
    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, DecodeError> {
    let line = std::str::from_utf8(line).map_err(|_| DecodeError::BadChunk)?;
    let size_part = line.split(';').next().unwrap_or("").trim();
    if size_part.is_empty() {
        return Err(DecodeError::BadChunk);
    }
    usize::from_str_radix(size_part, 16).map_err(|_| DecodeError::BadChunk)
}

/// Serializes a response for a request of the given `version`.
///
/// Adds `Content-Length` when absent and a `Connection` header matching the
/// keep-alive decision (`close`, or `keep-alive` for HTTP/1.0 clients that
/// asked for it).
#[must_use]
pub fn encode_response(resp: &Response, version: Version, keep_alive: bool) -> Vec<u8> {
    use std::fmt::Write;

    let reason = if resp.reason.is_empty() {
        default_reason(resp.status)
    } else {
        &resp.reason
    };

    let mut head = String::with_capacity(256);
    let _ = write!(head, "{} {} {}\r\n", version, resp.status, reason);

    let mut has_content_length = false;
    let mut has_connection = false;
    for (name, value) in &resp.headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }
    if !has_content_length {
        let _ = write!(head, "Content-Length: {}\r\n", resp.body.len());
    }
    if !has_connection {
        if !keep_alive {
            head.push_str("Connection: close\r\n");
        } else if version == Version::Http10 {
            head.push_str("Connection: keep-alive\r\n");
        }
    }
    head.push_str("\r\n");

    let mut out = Vec::with_capacity(head.len() + resp.body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(&resp.body);
    out
}

/// Whether the connection stays open after answering `headers` on a
/// `version` request: explicit `Connection` header first, then the
/// version's default (HTTP/1.1 keep-alive, HTTP/1.0 close).
#[must_use]
pub fn keep_alive(version: Version, headers: &[(String, String)]) -> bool {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case("close") {
                return false;
            }
            if value.eq_ignore_ascii_case("keep-alive") {
                return true;
            }
        }
    }
    version == Version::Http11
}
