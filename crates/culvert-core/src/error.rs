//! Error types.

use core::fmt;

/// Errors while decoding a wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The length prefix claimed fewer bytes than the smallest valid frame.
    FrameTooShort { len: usize },
    /// The length prefix exceeds the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// Unknown message tag byte.
    UnknownTag(u8),
    /// The body was shorter than the variant requires.
    Truncated { tag: u8, len: usize },
    /// The body length is not valid for the variant (e.g. odd port list).
    InvalidBody { tag: u8, len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooShort { len } => write!(f, "frame too short: {len} bytes"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::UnknownTag(tag) => write!(f, "unknown message tag {tag:#04x}"),
            Self::Truncated { tag, len } => {
                write!(f, "truncated body for tag {tag:#04x}: {len} bytes")
            }
            Self::InvalidBody { tag, len } => {
                write!(f, "invalid body length {len} for tag {tag:#04x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Transport-level errors on a single link.
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the connection, or every link of the tunnel is gone.
    Closed,
    Io(std::io::Error),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e)
        }
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Errors during the negotiation handshake. Fatal to endpoint startup.
#[derive(Debug)]
pub enum NegotiateError {
    /// Could not bind the control port or a transfer port.
    Bind { port: u16, source: std::io::Error },
    /// Could not reach the peer's control or transfer port.
    Connect { port: u16, source: std::io::Error },
    /// The peer sent something other than the expected handshake message.
    Protocol { expected: &'static str, got: &'static str },
    /// The port list does not cover the declared socket counts.
    PortCountMismatch { declared: usize, assigned: usize },
    Transport(TransportError),
}

impl fmt::Display for NegotiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, source } => write!(f, "failed to bind port {port}: {source}"),
            Self::Connect { port, source } => {
                write!(f, "failed to connect to port {port}: {source}")
            }
            Self::Protocol { expected, got } => {
                write!(f, "handshake protocol violation: expected {expected}, got {got}")
            }
            Self::PortCountMismatch { declared, assigned } => write!(
                f,
                "declared {declared} sockets but peer assigned {assigned} ports"
            ),
            Self::Transport(e) => write!(f, "handshake transport error: {e}"),
        }
    }
}

impl std::error::Error for NegotiateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::Connect { source, .. } => Some(source),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for NegotiateError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Errors surfaced to callers of remote procedures.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    /// The remote handler failed; carries its error text verbatim.
    Remote { message: String },
    /// The name is not present in the peer's procedure listing.
    UnknownProcedure(String),
    /// Every link of the tunnel died while the call was in flight.
    Disconnected,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Remote { message } => write!(f, "remote error: {message}"),
            Self::UnknownProcedure(name) => write!(f, "unknown remote procedure {name:?}"),
            Self::Disconnected => write!(f, "tunnel disconnected"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Failure of a locally registered procedure, reported back to the remote
/// caller as the text of an `Error` message.
#[derive(Debug, Clone)]
pub struct ProcedureError {
    message: String,
}

impl ProcedureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProcedureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProcedureError {}

impl From<String> for ProcedureError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProcedureError {
    fn from(message: &str) -> Self {
        Self { message: message.to_owned() }
    }
}
