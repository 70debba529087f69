//! Error types for the wire protocol.

use thiserror::Error;

/// A message field was malformed or out of range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed {message} message: {cause}")]
pub struct FormatError {
    /// Name of the message type being built or decoded
    pub message: &'static str,
    /// Human-readable cause
    pub cause: String,
}

impl FormatError {
    pub fn new(message: &'static str, cause: impl Into<String>) -> Self {
        Self {
            message,
            cause: cause.into(),
        }
    }
}

/// Decoding a single message body failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// A datagram failed structural validation and must be discarded as a whole.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid message count: {0}")]
    InvalidCount(u8),

    #[error("message header truncated at offset {offset}")]
    TruncatedHeader { offset: usize },

    #[error("invalid message length {length} with {remaining} bytes remaining")]
    InvalidLength { length: u16, remaining: usize },

    #[error("message {number}: {source}")]
    Message {
        number: u16,
        #[source]
        source: DecodeError,
    },
}

/// Connect-port datagram was not understood.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("connect message is not NUL-terminated")]
    Unterminated,

    #[error("unrecognised connect message {0:?}")]
    Unrecognised(String),
}
