//! Wire protocol framing for loom.
//!
//! This crate implements the byte-level protocol spoken between loom clients
//! and the broker over a single ordered duplex stream: unsigned LEB128
//! varints, the four frame shapes, and a pull-based reader for chunked
//! message bodies.
//!
//! ## Wire Format
//!
//! ```text
//! Handshake:      "LOOM" | version (1 byte, = 4) | role ('P' | 'C')
//!                 | varint(len) name | varint(len) room | varint(len) token
//! Message header: varint(len) key | varint(declared_size) | varint(msg_id)
//! Chunk:          varint(len) payload        (len = 0 ends the message)
//! Ack:            varint(1) | varint(msg_id)
//! ```
//!
//! Every decoder takes an explicit bound for each variable-length field and
//! fails before allocating when a peer declares more.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod body;
pub mod error;
pub mod frame;
pub mod varint;

// Re-export main types
pub use body::BodyReader;
pub use error::{Field, WireError};
pub use frame::{
    encode_ack, encode_hello, encode_message_header, read_ack, read_chunk, read_chunk_len,
    read_hello, read_message_header, write_ack, write_chunk, write_end_of_message, write_hello,
    write_message_header, Hello, HelloLimits, MessageHeader, Role, DEFAULT_MAX_CHUNK,
    DEFAULT_MAX_HELLO_FIELD, DEFAULT_MAX_KEY, FRAME_ACK, MAGIC, WIRE_VERSION,
};
pub use varint::{decode_uvarint, encode_uvarint, read_uvarint, uvarint_len, write_uvarint};
