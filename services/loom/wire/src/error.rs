//! Wire protocol error types.

use std::fmt;
use thiserror::Error;

/// Variable-length field carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Session name in the handshake
    Name,
    /// Room in the handshake
    Room,
    /// Token in the handshake
    Token,
    /// Message key in a header frame
    Key,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Name => "name",
            Field::Room => "room",
            Field::Token => "token",
            Field::Key => "key",
        };
        f.write_str(name)
    }
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Varint overflowed 64 bits or the stream ended mid-sequence
    #[error("malformed varint")]
    MalformedVarint,

    /// Declared field length exceeds the caller's bound
    #[error("{field} too large: {len} > {max}")]
    FieldTooLarge {
        /// Which field overflowed
        field: Field,
        /// Declared length
        len: u64,
        /// Configured maximum
        max: usize,
    },

    /// Magic or version byte mismatch
    #[error("bad handshake")]
    BadHandshake,

    /// Role byte is neither 'P' nor 'C'
    #[error("unknown role {0:#04x}")]
    UnknownRole(u8),

    /// Handshake string is not valid UTF-8
    #[error("{0} is not valid utf-8")]
    Utf8(Field),

    /// Message header carries an empty key
    #[error("empty key")]
    EmptyKey,

    /// Declared chunk length exceeds the caller's bound
    #[error("chunk too large: {len} > {max}")]
    ChunkTooLarge {
        /// Declared length
        len: u64,
        /// Configured maximum
        max: usize,
    },

    /// Frame tag other than the one expected at this position
    #[error("unexpected frame kind {0}")]
    UnexpectedFrame(u64),

    /// Underlying stream failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's writer rejected body bytes; the stream itself may be fine
    #[error("body sink: {0}")]
    Sink(#[source] std::io::Error),
}

impl WireError {
    /// True when the stream ended early, either between frames or part way
    /// through one.
    pub fn is_eof(&self) -> bool {
        matches!(self, WireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
