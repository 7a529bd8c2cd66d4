//! HTTP/1.1 message codec.
//!
//! Encodes request heads and body framing onto a byte buffer and decodes
//! response heads and bodies from one. The decoder is incremental: it is fed
//! whatever bytes the transport produced and reports when it needs more, so
//! the connection layer never over-reads past the end of an exchange.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

use crate::error::{Error, ErrorKind, Result};

/// How the response body is framed, per RFC 7230 §3.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No body follows the head (1xx/204/304, or a HEAD response).
    Empty,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The body runs until the peer closes the connection.
    UntilClose,
}

/// A decoded response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body_kind: BodyKind,
    /// Either side demanded `Connection: close`, or framing forces it.
    pub close: bool,
}

/// Writes the request line, headers and framing headers into `dst`.
///
/// `Host` is injected first unless the caller supplied one. A known body
/// length emits `Content-Length` (omitted for zero-length bodies on methods
/// that conventionally carry none); an unknown length emits
/// `Transfer-Encoding: chunked`.
pub(crate) fn encode_request_head(
    dst: &mut BytesMut,
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    content_type: Option<&str>,
    body_len: Option<u64>,
    keep_alive: bool,
) {
    dst.extend_from_slice(method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(http::header::HOST) {
        dst.extend_from_slice(b"Host: ");
        dst.extend_from_slice(host.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if let Some(content_type) = content_type {
        if !headers.contains_key(http::header::CONTENT_TYPE) {
            dst.extend_from_slice(b"Content-Type: ");
            dst.extend_from_slice(content_type.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
    }

    match body_len {
        Some(0) => {
            if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
                dst.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
        Some(len) => {
            dst.extend_from_slice(b"Content-Length: ");
            dst.extend_from_slice(len.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        None => {
            dst.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    if !headers.contains_key(http::header::CONNECTION) {
        if keep_alive {
            dst.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            dst.extend_from_slice(b"Connection: close\r\n");
        }
    }

    dst.extend_from_slice(b"\r\n");
}

/// Frames one chunk of a request body with unknown length.
pub(crate) fn encode_chunk(dst: &mut BytesMut, data: &[u8]) {
    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// Terminates a chunked request body.
pub(crate) fn encode_final_chunk(dst: &mut BytesMut) {
    dst.extend_from_slice(b"0\r\n\r\n");
}

/// Attempts to decode a response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, or the parsed head plus
/// the number of bytes consumed. Heads larger than `max_header_size` are a
/// protocol error.
pub(crate) fn decode_response_head(
    buf: &[u8],
    head_request: bool,
    max_header_size: usize,
) -> Result<Option<(ResponseHead, usize)>> {
    let Some(end) = find_head_end(buf) else {
        if buf.len() > max_header_size {
            return Err(Error::with_context(
                ErrorKind::ProtocolError,
                "response head too large",
            ));
        }
        return Ok(None);
    };
    if end > max_header_size {
        return Err(Error::with_context(
            ErrorKind::ProtocolError,
            "response head too large",
        ));
    }

    let head = &buf[..end];
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::with_context(ErrorKind::ProtocolError, "non-ascii response head"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::with_context(ErrorKind::ProtocolError, "empty status line"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(Error::with_context(
            ErrorKind::ProtocolError,
            format!("unsupported version {version:?}"),
        ));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::with_context(ErrorKind::ProtocolError, "malformed status line"))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Obsolete line folding is rejected rather than unfolded.
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(Error::with_context(
                ErrorKind::ProtocolError,
                "folded header line",
            ));
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            Error::with_context(ErrorKind::ProtocolError, "header line missing colon")
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))?;
        headers.append(name, value);
    }

    let (body_kind, force_close) = derive_body_kind(status, &headers, head_request)?;
    let close = force_close || wants_close(&headers) || version == "HTTP/1.0";

    Ok(Some((
        ResponseHead {
            status,
            headers,
            body_kind,
            close,
        },
        end + 4,
    )))
}

/// RFC 7230 §3.3.3 body framing rules. The second element is true when the
/// framing itself forces the connection closed (`UntilClose`).
fn derive_body_kind(
    status: StatusCode,
    headers: &HeaderMap,
    head_request: bool,
) -> Result<(BodyKind, bool)> {
    if head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok((BodyKind::Empty, false));
    }

    let chunked = headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    let content_length = headers.get(http::header::CONTENT_LENGTH);

    if chunked {
        if content_length.is_some() {
            return Err(Error::with_context(
                ErrorKind::ProtocolError,
                "both Content-Length and Transfer-Encoding present",
            ));
        }
        return Ok((BodyKind::Chunked, false));
    }

    if let Some(value) = content_length {
        if headers
            .get_all(http::header::CONTENT_LENGTH)
            .iter()
            .any(|v| v != value)
        {
            return Err(Error::with_context(
                ErrorKind::ProtocolError,
                "conflicting Content-Length values",
            ));
        }
        let len = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                Error::with_context(ErrorKind::ProtocolError, "malformed Content-Length")
            })?;
        return Ok((BodyKind::Fixed(len), false));
    }

    Ok((BodyKind::UntilClose, true))
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataEnd,
    Trailers,
}

/// Incremental body decoder bound to one response's [`BodyKind`].
///
/// `decode` consumes framing and payload from the front of the input buffer
/// and yields payload bytes; `Ok(None)` means the decoder needs more input
/// (never returned once [`is_done`](Self::is_done) is true).
#[derive(Debug)]
pub(crate) struct BodyDecoder {
    kind: BodyKind,
    phase: ChunkPhase,
    remaining: u64,
    total: u64,
    limit: u64,
    done: bool,
}

impl BodyDecoder {
    pub(crate) fn new(kind: BodyKind, limit: u64) -> Self {
        let (remaining, done) = match kind {
            BodyKind::Empty => (0, true),
            BodyKind::Fixed(n) => (n, n == 0),
            BodyKind::Chunked | BodyKind::UntilClose => (0, false),
        };
        Self {
            kind,
            phase: ChunkPhase::Size,
            remaining,
            total: 0,
            limit,
            done,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Total payload bytes produced so far.
    pub(crate) fn bytes_read(&self) -> u64 {
        self.total
    }

    /// Decodes as much payload as `buf` currently allows.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let out = match self.kind {
            BodyKind::Empty => return Ok(None),
            BodyKind::Fixed(_) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (buf.len() as u64).min(self.remaining) as usize;
                let data = buf.split_to(take).freeze();
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                data
            }
            BodyKind::UntilClose => {
                if buf.is_empty() {
                    return Ok(None);
                }
                buf.split().freeze()
            }
            BodyKind::Chunked => match self.decode_chunked(buf)? {
                Some(data) => data,
                None => return Ok(None),
            },
        };

        self.total += out.len() as u64;
        if self.total > self.limit {
            return Err(Error::new(ErrorKind::BodyTooLarge));
        }
        Ok(Some(out))
    }

    /// The transport reached EOF. Legal only for `UntilClose` bodies (or
    /// bodies that were already complete).
    pub(crate) fn on_eof(&mut self) -> Result<()> {
        match self.kind {
            BodyKind::UntilClose => {
                self.done = true;
                Ok(())
            }
            _ if self.done => Ok(()),
            _ => Err(Error::new(ErrorKind::UnexpectedEof)),
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.phase {
                ChunkPhase::Size => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    let text = std::str::from_utf8(&line[..line_end]).map_err(|_| {
                        Error::with_context(ErrorKind::ProtocolError, "malformed chunk size")
                    })?;
                    // Chunk extensions (";key=value") are ignored.
                    let size_hex = text.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
                        Error::with_context(ErrorKind::ProtocolError, "malformed chunk size")
                    })?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailers;
                    } else {
                        self.remaining = size;
                        self.phase = ChunkPhase::Data;
                    }
                }
                ChunkPhase::Data => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (buf.len() as u64).min(self.remaining) as usize;
                    let data = buf.split_to(take).freeze();
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.phase = ChunkPhase::DataEnd;
                    }
                    return Ok(Some(data));
                }
                ChunkPhase::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    let sep = buf.split_to(2);
                    if &sep[..] != b"\r\n" {
                        return Err(Error::with_context(
                            ErrorKind::ProtocolError,
                            "missing chunk terminator",
                        ));
                    }
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    // Trailer fields are consumed and discarded.
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    if line_end == 0 {
                        self.done = true;
                        return Ok(None);
                    }
                    let _ = line;
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_head(raw: &[u8]) -> ResponseHead {
        decode_response_head(raw, false, 64 * 1024)
            .unwrap()
            .expect("complete head")
            .0
    }

    #[test]
    fn parses_status_and_headers() {
        let head = decode_head(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\n");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.body_kind, BodyKind::Fixed(5));
        assert_eq!(head.headers.get("x-test").unwrap(), "yes");
        assert!(!head.close);
    }

    #[test]
    fn incomplete_head_needs_more() {
        let out = decode_response_head(b"HTTP/1.1 200 OK\r\nContent-L", false, 64 * 1024).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn chunked_wins_and_conflict_is_rejected() {
        let head = decode_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(head.body_kind, BodyKind::Chunked);

        let err = decode_response_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
            false,
            64 * 1024,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn no_framing_means_until_close() {
        let head = decode_head(b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(head.body_kind, BodyKind::UntilClose);
        assert!(head.close);
    }

    #[test]
    fn status_without_body() {
        for raw in [
            &b"HTTP/1.1 204 No Content\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n"[..],
        ] {
            assert_eq!(decode_head(raw).body_kind, BodyKind::Empty);
        }
        let head = decode_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
            true,
            64 * 1024,
        )
        .unwrap()
        .unwrap()
        .0;
        assert_eq!(head.body_kind, BodyKind::Empty);
    }

    #[test]
    fn connection_close_is_detected() {
        let head = decode_head(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        assert!(head.close);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(200));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = decode_response_head(&raw, false, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn fixed_decoder_counts_down() {
        let mut dec = BodyDecoder::new(BodyKind::Fixed(5), u64::MAX);
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"hel"[..]);
        assert!(!dec.is_done());
        let mut buf = BytesMut::from(&b"loEXTRA"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"lo"[..]);
        assert!(dec.is_done());
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[test]
    fn chunked_decoder_handles_split_input() {
        let mut dec = BodyDecoder::new(BodyKind::Chunked, u64::MAX);
        let mut buf = BytesMut::from(&b"5\r\nhe"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"he"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"llo\r\n4\r\nwo");
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"llo"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"wo"[..]);

        buf.extend_from_slice(b"rl\r\n0\r\n\r\n");
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"rl"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        assert!(dec.is_done());
        assert_eq!(dec.bytes_read(), 9);
    }

    #[test]
    fn chunked_decoder_ignores_extensions_and_trailers() {
        let mut dec = BodyDecoder::new(BodyKind::Chunked, u64::MAX);
        let mut buf = BytesMut::from(&b"3;ext=1\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"abc"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        assert!(dec.is_done());
    }

    #[test]
    fn decoder_enforces_size_limit() {
        let mut dec = BodyDecoder::new(BodyKind::Fixed(10), 4);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let err = dec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BodyTooLarge);
    }

    #[test]
    fn eof_rules() {
        let mut dec = BodyDecoder::new(BodyKind::UntilClose, u64::MAX);
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), &b"partial"[..]);
        dec.on_eof().unwrap();
        assert!(dec.is_done());

        let mut dec = BodyDecoder::new(BodyKind::Fixed(5), u64::MAX);
        assert_eq!(dec.on_eof().unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn encodes_request_head_with_length() {
        let mut dst = BytesMut::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("1"));
        encode_request_head(
            &mut dst,
            &Method::POST,
            "/submit?a=1",
            "example.com",
            &headers,
            Some("application/json"),
            Some(2),
            true,
        );
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("POST /submit?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("x-custom: 1\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unknown_length_uses_chunked_framing() {
        let mut dst = BytesMut::new();
        encode_request_head(
            &mut dst,
            &Method::PUT,
            "/upload",
            "example.com",
            &HeaderMap::new(),
            None,
            None,
            false,
        );
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Connection: close\r\n"));

        let mut dst = BytesMut::new();
        encode_chunk(&mut dst, b"hello");
        encode_final_chunk(&mut dst);
        assert_eq!(&dst[..], b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn get_with_empty_body_omits_length() {
        let mut dst = BytesMut::new();
        encode_request_head(
            &mut dst,
            &Method::GET,
            "/",
            "example.com",
            &HeaderMap::new(),
            None,
            Some(0),
            true,
        );
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(!text.contains("Content-Length"));

        let mut dst = BytesMut::new();
        encode_request_head(
            &mut dst,
            &Method::POST,
            "/",
            "example.com",
            &HeaderMap::new(),
            None,
            Some(0),
            true,
        );
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn round_trips_chunked_request_body() {
        // Encode a chunked body, then feed the framed bytes through the
        // response-side decoder: content must survive unchanged.
        let mut framed = BytesMut::new();
        for piece in [&b"alpha"[..], &b"beta"[..], &b"gamma"[..]] {
            encode_chunk(&mut framed, piece);
        }
        encode_final_chunk(&mut framed);

        let mut dec = BodyDecoder::new(BodyKind::Chunked, u64::MAX);
        let mut out = Vec::new();
        while let Some(data) = dec.decode(&mut framed).unwrap() {
            out.extend_from_slice(&data);
        }
        assert!(dec.is_done());
        assert_eq!(out, b"alphabetagamma");
    }
}
