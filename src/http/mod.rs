pub mod headers;
pub mod parser;
pub mod url;

pub use headers::Headers;
pub use parser::{HttpParser, ParserKind, ParserState};
pub use url::Url;

use bytes::Bytes;

pub const METHOD_CONNECT: &[u8] = b"CONNECT";

/// Method tokens the parser classifies a request line by.
pub const KNOWN_METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];

/// Canonical reply to a `CONNECT` once the upstream leg is up.
pub const PROXY_TUNNEL_ESTABLISHED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Build a minimal synthesized response: status line, the given headers, a
/// `Content-Length` for the body, blank line, body.
pub fn build_response(
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Bytes {
    let mut buf = Vec::with_capacity(128 + body.len());
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut code = itoa::Buffer::new();
    buf.extend_from_slice(code.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"Content-Length: ");
    let mut length = itoa::Buffer::new();
    buf.extend_from_slice(length.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(body);
    Bytes::from(buf)
}

/// Synthesized error response; always closes the exchange.
pub fn error_response(status: u16, reason: &str) -> Bytes {
    build_response(status, reason, &[("Connection", "close")], reason.as_bytes())
}
