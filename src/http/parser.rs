use bytes::{Bytes, BytesMut};

use crate::error::ProxyError;
use crate::http::headers::{trim_ascii, Headers};
use crate::http::url::Url;
use crate::http::{KNOWN_METHODS, METHOD_CONNECT};

/// Parser position within a message. Transitions are monotonic — state
/// never decreases across incremental feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserState {
    Initialized = 0,
    LineReceived = 1,
    ReceivingHeaders = 2,
    HeadersComplete = 3,
    ReceivingBody = 4,
    Complete = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    Size,
    Data { remaining: usize },
    DataTerminator,
    Trailers,
}

/// Incremental HTTP/1.x parser; also the parsed message itself.
///
/// The caller owns the byte buffer: `parse` consumes what it can from the
/// given slice and reports how many bytes it took, so fragmented input and
/// pipelined messages both work — feed the leftover again later. Only an
/// incomplete line is buffered internally.
#[derive(Debug)]
pub struct HttpParser {
    kind: ParserKind,
    state: ParserState,
    pub method: Option<Bytes>,
    pub url: Option<Url>,
    pub version: Option<Bytes>,
    pub code: Option<u16>,
    pub reason: Option<Bytes>,
    headers: Headers,
    body: BytesMut,
    /// Original request-target bytes, kept for faithful re-serialisation.
    target: Option<Bytes>,
    line_buf: BytesMut,
    header_bytes: usize,
    content_length: Option<usize>,
    chunked: bool,
    chunk: ChunkPhase,
    until_close: bool,
    streaming: bool,
    dirty: bool,
    max_line_bytes: usize,
    max_header_bytes: usize,
}

pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

impl HttpParser {
    pub fn request() -> Self {
        Self::new(ParserKind::Request)
    }

    pub fn response() -> Self {
        Self::new(ParserKind::Response)
    }

    pub fn new(kind: ParserKind) -> Self {
        Self {
            kind,
            state: ParserState::Initialized,
            method: None,
            url: None,
            version: None,
            code: None,
            reason: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            target: None,
            line_buf: BytesMut::new(),
            header_bytes: 0,
            content_length: None,
            chunked: false,
            chunk: ChunkPhase::Size,
            until_close: false,
            streaming: false,
            dirty: false,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }

    pub fn with_limits(mut self, max_line_bytes: usize, max_header_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self.max_header_bytes = max_header_bytes;
        self
    }

    /// Stream body chunks instead of accumulating them; the caller drains
    /// via [`take_body`](Self::take_body) after each `parse`. Used when
    /// proxying so response bodies never pile up in memory.
    pub fn set_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    pub fn kind(&self) -> ParserKind {
        self.kind
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable header access marks the message dirty: serialisation will
    /// re-frame `Content-Length` against the stored body.
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.dirty = true;
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = BytesMut::from(&body[..]);
        self.dirty = true;
    }

    /// Drain the body bytes decoded so far.
    pub fn take_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    pub fn is_connect(&self) -> bool {
        self.method.as_deref() == Some(METHOD_CONNECT)
    }

    /// True when the body is close-delimited (no framing headers).
    pub fn is_until_close(&self) -> bool {
        self.until_close
    }

    /// Whether the connection may carry another exchange after this message:
    /// HTTP/1.1 unless `Connection: close`, HTTP/1.0 only with an explicit
    /// `keep-alive`, and never for close-delimited bodies.
    pub fn is_reusable(&self) -> bool {
        if self.until_close {
            return false;
        }
        if self.headers.value_has_token(b"connection", b"close") {
            return false;
        }
        match self.version.as_deref() {
            Some(b"HTTP/1.1") => true,
            Some(b"HTTP/1.0") => self.headers.value_has_token(b"connection", b"keep-alive"),
            _ => false,
        }
    }

    /// The upstream never sent framing for this body; connection close is
    /// the terminator.
    pub fn mark_eof(&mut self) {
        if self.until_close && self.state == ParserState::ReceivingBody {
            self.state = ParserState::Complete;
        }
    }

    /// Consume as much of `data` as possible, advancing the state machine.
    /// Returns the number of bytes consumed; the caller keeps the rest.
    pub fn parse(&mut self, data: &[u8]) -> Result<usize, ProxyError> {
        let mut consumed = 0;
        loop {
            match self.state {
                ParserState::Complete => break,
                ParserState::Initialized => {
                    match self.next_line(data, &mut consumed)? {
                        None => {
                            if self.line_buf.len() > self.max_line_bytes {
                                return Err(ProxyError::OversizedRequest(format!(
                                    "start line exceeds {} bytes",
                                    self.max_line_bytes
                                )));
                            }
                            break;
                        }
                        // Tolerate a stray CRLF before the start line.
                        Some(line) if line.is_empty() => continue,
                        Some(line) => {
                            if line.len() > self.max_line_bytes {
                                return Err(ProxyError::OversizedRequest(format!(
                                    "start line exceeds {} bytes",
                                    self.max_line_bytes
                                )));
                            }
                            self.process_start_line(&line)?;
                            self.state = ParserState::LineReceived;
                        }
                    }
                }
                ParserState::LineReceived | ParserState::ReceivingHeaders => {
                    match self.next_line(data, &mut consumed)? {
                        None => {
                            if self.header_bytes + self.line_buf.len() > self.max_header_bytes {
                                return Err(ProxyError::OversizedRequest(format!(
                                    "header block exceeds {} bytes",
                                    self.max_header_bytes
                                )));
                            }
                            break;
                        }
                        Some(line) if line.is_empty() => {
                            self.state = ParserState::HeadersComplete;
                            self.decide_framing()?;
                        }
                        Some(line) => {
                            self.header_bytes += line.len() + 2;
                            if self.header_bytes > self.max_header_bytes {
                                return Err(ProxyError::OversizedRequest(format!(
                                    "header block exceeds {} bytes",
                                    self.max_header_bytes
                                )));
                            }
                            self.process_header_line(&line)?;
                            self.state = ParserState::ReceivingHeaders;
                        }
                    }
                }
                // decide_framing always moves past this state; never observed
                // between parse calls.
                ParserState::HeadersComplete => unreachable!("framing decided at header end"),
                ParserState::ReceivingBody => {
                    if self.chunked {
                        if !self.parse_chunk(data, &mut consumed)? {
                            break;
                        }
                    } else if let Some(remaining) = self.content_length {
                        let available = data.len() - consumed;
                        if available == 0 && remaining > 0 {
                            break;
                        }
                        let take = available.min(remaining);
                        self.body.extend_from_slice(&data[consumed..consumed + take]);
                        consumed += take;
                        let remaining = remaining - take;
                        self.content_length = Some(remaining);
                        if remaining == 0 {
                            self.state = ParserState::Complete;
                        }
                    } else {
                        // Close-delimited: everything is body until EOF.
                        if consumed == data.len() {
                            break;
                        }
                        self.body.extend_from_slice(&data[consumed..]);
                        consumed = data.len();
                    }
                }
            }
        }
        Ok(consumed)
    }

    /// Pull the next CRLF-terminated line out of `data`, joining with any
    /// partial line buffered from an earlier feed. `None` means more bytes
    /// are needed.
    fn next_line(&mut self, data: &[u8], consumed: &mut usize) -> Result<Option<Vec<u8>>, ProxyError> {
        let rest = &data[*consumed..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(at) => {
                let mut line = self.line_buf.split().to_vec();
                line.extend_from_slice(&rest[..at]);
                *consumed += at + 1;
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                self.line_buf.extend_from_slice(rest);
                *consumed = data.len();
                Ok(None)
            }
        }
    }

    fn process_start_line(&mut self, line: &[u8]) -> Result<(), ProxyError> {
        match self.kind {
            ParserKind::Request => {
                let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
                let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next())
                {
                    (Some(m), Some(t), Some(v)) if tokens.next().is_none() => (m, t, v),
                    _ => {
                        return Err(ProxyError::MalformedRequestLine(printable(line)));
                    }
                };
                if !KNOWN_METHODS.contains(&method) {
                    return Err(ProxyError::MalformedRequestLine(format!(
                        "unknown method {}",
                        printable(method)
                    )));
                }
                if !version.starts_with(b"HTTP/") {
                    return Err(ProxyError::MalformedRequestLine(format!(
                        "bad version {}",
                        printable(version)
                    )));
                }
                self.url = Some(Url::from_bytes(target)?);
                self.method = Some(Bytes::copy_from_slice(method));
                self.target = Some(Bytes::copy_from_slice(target));
                self.version = Some(Bytes::copy_from_slice(version));
            }
            ParserKind::Response => {
                if !line.starts_with(b"HTTP/") {
                    return Err(ProxyError::MalformedRequestLine(format!(
                        "not a status line: {}",
                        printable(line)
                    )));
                }
                let mut tokens = line.splitn(3, |&b| b == b' ');
                let version = tokens.next().unwrap_or_default();
                let code = tokens.next().unwrap_or_default();
                let reason = tokens.next().unwrap_or_default();
                let code = std::str::from_utf8(code)
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok())
                    .filter(|c| (100..1000).contains(c))
                    .ok_or_else(|| {
                        ProxyError::MalformedRequestLine(format!(
                            "bad status code in {}",
                            printable(line)
                        ))
                    })?;
                self.version = Some(Bytes::copy_from_slice(version));
                self.code = Some(code);
                self.reason = Some(Bytes::copy_from_slice(reason));
            }
        }
        Ok(())
    }

    fn process_header_line(&mut self, line: &[u8]) -> Result<(), ProxyError> {
        // Obsolete line folding (leading whitespace continuation) is rejected
        // outright rather than spliced into the previous value.
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ProxyError::MalformedHeader(format!(
                "obsolete line folding: {}",
                printable(line)
            )));
        }
        let at = line.iter().position(|&b| b == b':').ok_or_else(|| {
            ProxyError::MalformedHeader(format!("missing colon: {}", printable(line)))
        })?;
        let name = trim_ascii(&line[..at]);
        if name.is_empty() {
            return Err(ProxyError::MalformedHeader(format!(
                "empty header name: {}",
                printable(line)
            )));
        }
        let value = trim_ascii(&line[at + 1..]);
        self.headers
            .add(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        Ok(())
    }

    /// Body framing precedence at header end: chunked transfer coding, then
    /// Content-Length, then the bodyless cases, then close-delimited
    /// (responses only).
    fn decide_framing(&mut self) -> Result<(), ProxyError> {
        if self
            .headers
            .value_has_token(b"transfer-encoding", b"chunked")
        {
            self.chunked = true;
            self.chunk = ChunkPhase::Size;
            self.state = ParserState::ReceivingBody;
            return Ok(());
        }
        if let Some(value) = self.headers.get(b"content-length") {
            let length = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or_else(|| {
                    ProxyError::MalformedHeader(format!(
                        "invalid content-length {}",
                        printable(value)
                    ))
                })?;
            if length == 0 {
                self.state = ParserState::Complete;
            } else {
                self.content_length = Some(length);
                self.state = ParserState::ReceivingBody;
            }
            return Ok(());
        }
        match self.kind {
            // Requests without a body indicator have no body; CONNECT always
            // completes at header end.
            ParserKind::Request => self.state = ParserState::Complete,
            ParserKind::Response => {
                let code = self.code.unwrap_or(0);
                if (100..200).contains(&code) || code == 204 || code == 304 {
                    self.state = ParserState::Complete;
                } else {
                    self.until_close = true;
                    self.state = ParserState::ReceivingBody;
                }
            }
        }
        Ok(())
    }

    /// One pass over the chunked-body machine. Returns false when more
    /// bytes are needed.
    fn parse_chunk(&mut self, data: &[u8], consumed: &mut usize) -> Result<bool, ProxyError> {
        loop {
            match self.chunk {
                ChunkPhase::Size => match self.next_line(data, consumed)? {
                    None => {
                        if self.line_buf.len() > self.max_line_bytes {
                            return Err(ProxyError::InvalidChunkedBody(
                                "chunk size line too long".into(),
                            ));
                        }
                        return Ok(false);
                    }
                    Some(line) => {
                        // Chunk extensions after ';' are ignored.
                        let token = line.split(|&b| b == b';').next().unwrap_or_default();
                        let size = std::str::from_utf8(trim_ascii(token))
                            .ok()
                            .and_then(|s| usize::from_str_radix(s, 16).ok())
                            .ok_or_else(|| {
                                ProxyError::InvalidChunkedBody(format!(
                                    "bad chunk size: {}",
                                    printable(&line)
                                ))
                            })?;
                        self.chunk = if size == 0 {
                            ChunkPhase::Trailers
                        } else {
                            ChunkPhase::Data { remaining: size }
                        };
                    }
                },
                ChunkPhase::Data { remaining } => {
                    let available = data.len() - *consumed;
                    if available == 0 {
                        return Ok(false);
                    }
                    let take = available.min(remaining);
                    self.body
                        .extend_from_slice(&data[*consumed..*consumed + take]);
                    *consumed += take;
                    if take == remaining {
                        self.chunk = ChunkPhase::DataTerminator;
                    } else {
                        self.chunk = ChunkPhase::Data {
                            remaining: remaining - take,
                        };
                    }
                }
                ChunkPhase::DataTerminator => match self.next_line(data, consumed)? {
                    None => return Ok(false),
                    Some(line) if line.is_empty() => self.chunk = ChunkPhase::Size,
                    Some(line) => {
                        return Err(ProxyError::InvalidChunkedBody(format!(
                            "missing chunk terminator, got {}",
                            printable(&line)
                        )));
                    }
                },
                ChunkPhase::Trailers => match self.next_line(data, consumed)? {
                    None => return Ok(false),
                    Some(line) if line.is_empty() => {
                        self.state = ParserState::Complete;
                        return Ok(true);
                    }
                    // Trailer fields are accepted and dropped.
                    Some(_) => {}
                },
            }
        }
    }

    /// Serialise the message as received: start line, headers in insertion
    /// order, blank line, body. Mutated messages are re-framed so the
    /// emitted Content-Length matches the stored body.
    pub fn build(&self) -> Bytes {
        let target = self.target.clone().unwrap_or_else(|| Bytes::from_static(b"/"));
        self.write_message(&target)
    }

    /// Serialise a proxied request for the upstream: the target collapses to
    /// origin-form (`/path?query`), as an origin server expects.
    pub fn build_upstream(&self) -> Bytes {
        let target = self
            .url
            .as_ref()
            .and_then(|u| u.remainder.clone())
            .unwrap_or_else(|| Bytes::from_static(b"/"));
        self.write_message(&target)
    }

    fn write_message(&self, target: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        match self.kind {
            ParserKind::Request => {
                buf.extend_from_slice(self.method.as_deref().unwrap_or(b"GET"));
                buf.push(b' ');
                buf.extend_from_slice(target);
                buf.push(b' ');
                buf.extend_from_slice(self.version.as_deref().unwrap_or(b"HTTP/1.1"));
            }
            ParserKind::Response => {
                buf.extend_from_slice(self.version.as_deref().unwrap_or(b"HTTP/1.1"));
                buf.push(b' ');
                let mut code = itoa::Buffer::new();
                buf.extend_from_slice(code.format(self.code.unwrap_or(200)).as_bytes());
                buf.push(b' ');
                buf.extend_from_slice(self.reason.as_deref().unwrap_or(b"OK"));
            }
        }
        buf.extend_from_slice(b"\r\n");

        let needs_reframing =
            self.chunked || (self.dirty && (self.headers.contains(b"content-length") || !self.body.is_empty()));
        if needs_reframing {
            let mut headers = self.headers.clone();
            // The stored body is the decoded payload; emit it with an exact
            // length instead of re-chunking.
            headers.remove(b"transfer-encoding");
            let mut length = itoa::Buffer::new();
            headers.set(
                Bytes::from_static(b"Content-Length"),
                Bytes::copy_from_slice(length.format(self.body.len()).as_bytes()),
            );
            headers.write_to(&mut buf);
        } else {
            self.headers.write_to(&mut buf);
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }
}

fn printable(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.chars().count() > 64 {
        let head: String = text.chars().take(64).collect();
        format!("{}...", head)
    } else {
        text.into_owned()
    }
}
