//! Frame encoding and decoding.
//!
//! Four frame shapes share one stream: the handshake (once per connection),
//! message headers, chunks (length-prefixed body slices, zero length ends a
//! message) and acks. Decoders take an explicit bound for every
//! variable-length field and reject larger declarations before allocating.

use crate::error::Field;
use crate::varint::{encode_uvarint, read_uvarint, write_uvarint};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Handshake magic
pub const MAGIC: &[u8; 4] = b"LOOM";

/// Protocol version byte
pub const WIRE_VERSION: u8 = 4;

/// Tag that opens an ack frame
pub const FRAME_ACK: u64 = 1;

/// Default bound for each handshake string
pub const DEFAULT_MAX_HELLO_FIELD: usize = 256;

/// Default bound for message keys
pub const DEFAULT_MAX_KEY: usize = 256;

/// Default bound for a single chunk payload
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

/// Session role announced in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Writes messages
    Producer,
    /// Reads and acks messages
    Consumer,
}

impl Role {
    /// Wire tag for the role
    pub const fn tag(self) -> u8 {
        match self {
            Role::Producer => b'P',
            Role::Consumer => b'C',
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            b'P' => Ok(Role::Producer),
            b'C' => Ok(Role::Consumer),
            other => Err(WireError::UnknownRole(other)),
        }
    }
}

/// Handshake frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Role of the sender
    pub role: Role,
    /// Client name
    pub name: String,
    /// Room the client joins
    pub room: String,
    /// Authentication token
    pub token: String,
}

/// Bounds applied while decoding a handshake
#[derive(Debug, Clone, Copy)]
pub struct HelloLimits {
    /// Longest accepted name
    pub max_name: usize,
    /// Longest accepted room
    pub max_room: usize,
    /// Longest accepted token
    pub max_token: usize,
}

impl Default for HelloLimits {
    fn default() -> Self {
        Self {
            max_name: DEFAULT_MAX_HELLO_FIELD,
            max_room: DEFAULT_MAX_HELLO_FIELD,
            max_token: DEFAULT_MAX_HELLO_FIELD,
        }
    }
}

/// Message header frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Non-empty message key
    pub key: Bytes,
    /// Size announced by the producer. Advisory only; never checked against
    /// the bytes that actually follow.
    pub declared_size: u64,
    /// Producer-assigned id, echoed by the consumer's ack
    pub msg_id: u64,
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) {
    encode_uvarint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

/// Encode a handshake frame
pub fn encode_hello(hello: &Hello, buf: &mut BytesMut) {
    buf.reserve(MAGIC.len() + 2 + hello.name.len() + hello.room.len() + hello.token.len() + 6);
    buf.put_slice(MAGIC);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(hello.role.tag());
    put_field(buf, hello.name.as_bytes());
    put_field(buf, hello.room.as_bytes());
    put_field(buf, hello.token.as_bytes());
}

/// Write a handshake frame and flush
pub async fn write_hello<W: AsyncWrite + Unpin>(writer: &mut W, hello: &Hello) -> Result<(), WireError> {
    let mut buf = BytesMut::new();
    encode_hello(hello, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    trace!("wrote hello ({} bytes, role {:?})", buf.len(), hello.role);
    Ok(())
}

/// Read a length-prefixed field, rejecting lengths above `max` before allocating
async fn read_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: Field,
    max: usize,
) -> Result<Vec<u8>, WireError> {
    let len = read_uvarint(reader).await?;
    if len > max as u64 {
        return Err(WireError::FieldTooLarge { field, len, max });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_string<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: Field,
    max: usize,
) -> Result<String, WireError> {
    let raw = read_field(reader, field, max).await?;
    String::from_utf8(raw).map_err(|_| WireError::Utf8(field))
}

/// Read a handshake frame
pub async fn read_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: &HelloLimits,
) -> Result<Hello, WireError> {
    let mut preface = [0u8; 6];
    reader.read_exact(&mut preface).await?;
    if &preface[..4] != MAGIC || preface[4] != WIRE_VERSION {
        return Err(WireError::BadHandshake);
    }
    let role = Role::from_tag(preface[5])?;
    let name = read_string(reader, Field::Name, limits.max_name).await?;
    let room = read_string(reader, Field::Room, limits.max_room).await?;
    let token = read_string(reader, Field::Token, limits.max_token).await?;
    Ok(Hello {
        role,
        name,
        room,
        token,
    })
}

/// Encode a message header frame
pub fn encode_message_header(header: &MessageHeader, buf: &mut BytesMut) -> Result<(), WireError> {
    if header.key.is_empty() {
        return Err(WireError::EmptyKey);
    }
    buf.reserve(header.key.len() + 30);
    put_field(buf, &header.key);
    encode_uvarint(header.declared_size, buf);
    encode_uvarint(header.msg_id, buf);
    Ok(())
}

/// Write a message header frame (no flush)
pub async fn write_message_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &MessageHeader,
) -> Result<(), WireError> {
    let mut buf = BytesMut::new();
    encode_message_header(header, &mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a message header frame
pub async fn read_message_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_key: usize,
) -> Result<MessageHeader, WireError> {
    let key_len = read_uvarint(reader).await?;
    if key_len == 0 {
        return Err(WireError::EmptyKey);
    }
    if key_len > max_key as u64 {
        return Err(WireError::FieldTooLarge {
            field: Field::Key,
            len: key_len,
            max: max_key,
        });
    }
    let mut key = vec![0u8; key_len as usize];
    reader.read_exact(&mut key).await?;
    let declared_size = read_uvarint(reader).await?;
    let msg_id = read_uvarint(reader).await?;
    Ok(MessageHeader {
        key: Bytes::from(key),
        declared_size,
        msg_id,
    })
}

/// Write one chunk frame (no flush). An empty payload is the
/// end-of-message terminator.
pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    write_uvarint(writer, payload.len() as u64).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Write the end-of-message terminator (no flush)
pub async fn write_end_of_message<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), WireError> {
    write_uvarint(writer, 0).await
}

/// Read a chunk length prefix, enforcing `max_chunk`. Zero means the
/// message ended.
pub async fn read_chunk_len<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_chunk: usize,
) -> Result<usize, WireError> {
    let len = read_uvarint(reader).await?;
    if len > max_chunk as u64 {
        return Err(WireError::ChunkTooLarge {
            len,
            max: max_chunk,
        });
    }
    Ok(len as usize)
}

/// Read one chunk frame. `None` is the end-of-message terminator.
pub async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_chunk: usize,
) -> Result<Option<Bytes>, WireError> {
    let len = read_chunk_len(reader, max_chunk).await?;
    if len == 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Encode an ack frame
pub fn encode_ack(msg_id: u64, buf: &mut BytesMut) {
    encode_uvarint(FRAME_ACK, buf);
    encode_uvarint(msg_id, buf);
}

/// Write an ack frame and flush
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, msg_id: u64) -> Result<(), WireError> {
    let mut buf = BytesMut::with_capacity(11);
    encode_ack(msg_id, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an ack frame and return the acknowledged message id
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, WireError> {
    let tag = read_uvarint(reader).await?;
    if tag != FRAME_ACK {
        return Err(WireError::UnexpectedFrame(tag));
    }
    read_uvarint(reader).await
}
