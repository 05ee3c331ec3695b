use core::fmt;
use std::fmt::{Debug, Display, Formatter};

/// Error kinds surfaced by the reactor/stream/connection core. Every kind
/// here is fatal to the connection it was raised on and non-fatal to the
/// server: the acceptor and reactor survive every per-connection failure.
pub enum ServerError {
    /// The request line or header block could not be parsed.
    MalformedHead,
    /// A form body (urlencoded or multipart) could not be parsed.
    MalformedBody,
    /// A percent-encoded byte sequence contained a non-hex digit.
    MalformedEncoding,
    /// `Content-Length` exceeded the stream's `max_buffer_size`.
    PayloadTooLarge,
    /// The read buffer would have exceeded `max_buffer_size`.
    BufferOverflow,
    /// The peer closed the socket. `mid_request` distinguishes a clean
    /// between-requests close from an EOF that cut off an in-flight request.
    PeerClosed { mid_request: bool },
    /// Any other I/O failure on a stream's socket.
    Io(std::io::Error),
    /// A request handler hit a contract violation — e.g. `write`/`finish`
    /// called on a `Request` whose `Connection` has moved on to a later
    /// request (generation mismatch).
    UserCallbackFault(String),
    /// Failure to bind or register the listening socket.
    Bind(std::io::Error),
}

impl Debug for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::MalformedHead => write!(f, "\x1b[31mERROR\x1b[0m: malformed request head"),
            ServerError::MalformedBody => write!(f, "\x1b[31mERROR\x1b[0m: malformed request body"),
            ServerError::MalformedEncoding => {
                write!(f, "\x1b[31mERROR\x1b[0m: malformed percent-encoding")
            }
            ServerError::PayloadTooLarge => {
                write!(f, "\x1b[31mERROR\x1b[0m: payload exceeds max_buffer_size")
            }
            ServerError::BufferOverflow => {
                write!(f, "\x1b[31mERROR\x1b[0m: read buffer exceeded max_buffer_size")
            }
            ServerError::PeerClosed { mid_request: true } => {
                write!(f, "\x1b[31mERROR\x1b[0m: peer closed connection mid-request")
            }
            ServerError::PeerClosed { mid_request: false } => {
                write!(f, "peer closed connection")
            }
            ServerError::Io(e) => write!(f, "\x1b[31mERROR\x1b[0m: io error: {e}"),
            ServerError::UserCallbackFault(msg) => {
                write!(f, "\x1b[31mERROR\x1b[0m: contract violation: {msg}")
            }
            ServerError::Bind(e) => write!(f, "\x1b[31mERROR\x1b[0m: failed to bind listener: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) | ServerError::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// True when this error kind closes the connection silently rather than
/// logging a warning — a clean between-requests peer close.
impl ServerError {
    pub fn is_quiet(&self) -> bool {
        matches!(self, ServerError::PeerClosed { mid_request: false })
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
