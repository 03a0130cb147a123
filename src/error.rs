use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// Non-recoverable socket failure on either side of a work.
    Transport(std::io::Error),
    MalformedRequestLine(String),
    MalformedHeader(String),
    MalformedRequestTarget(String),
    OversizedRequest(String),
    InvalidChunkedBody(String),
    /// DNS failure, connection refused, or upstream TLS handshake failure.
    UpstreamConnect(String),
    /// Leaf-certificate minting or signing failure.
    TlsIntercept(String),
    Plugin(String),
    Timeout(&'static str),
    Config(String),
}

impl ProxyError {
    /// True for the parse-error subkinds that map to `400 Bad Request`
    /// when raised on the client side of a work.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ProxyError::MalformedRequestLine(_)
                | ProxyError::MalformedHeader(_)
                | ProxyError::MalformedRequestTarget(_)
                | ProxyError::OversizedRequest(_)
                | ProxyError::InvalidChunkedBody(_)
        )
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Transport(e) => write!(f, "transport error: {}", e),
            ProxyError::MalformedRequestLine(msg) => write!(f, "malformed request line: {}", msg),
            ProxyError::MalformedHeader(msg) => write!(f, "malformed header: {}", msg),
            ProxyError::MalformedRequestTarget(msg) => {
                write!(f, "malformed request target: {}", msg)
            }
            ProxyError::OversizedRequest(msg) => write!(f, "oversized request: {}", msg),
            ProxyError::InvalidChunkedBody(msg) => write!(f, "invalid chunked body: {}", msg),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::TlsIntercept(msg) => write!(f, "tls interception error: {}", msg),
            ProxyError::Plugin(msg) => write!(f, "plugin error: {}", msg),
            ProxyError::Timeout(what) => write!(f, "timeout: {}", what),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Transport(e)
    }
}
