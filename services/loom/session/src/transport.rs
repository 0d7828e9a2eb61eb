//! Transport bindings for loom sessions.
//!
//! A transport turns client options into a [`Connection`]: a buffered reader,
//! a buffered writer with explicit flush, and whatever handles must stay
//! alive for the stream to keep working. Sessions only ever talk to the
//! [`Transport`] trait; the QUIC, HTTP/3 and in-memory bindings plug in
//! underneath it.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::options::{ClientOptions, TransportKind};
use crate::SessionError;

pub mod http3;
pub mod quic;

pub use http3::Http3Transport;
pub use quic::QuicTransport;

/// Buffer size used for both directions of a connection
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound for each step of a graceful close
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Read half of a physical stream
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a physical stream
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens physical connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one duplex stream ready for protocol framing
    async fn open(&self, options: &ClientOptions) -> Result<Connection, SessionError>;
}

/// Transport binding selected by `kind`
pub fn transport_for(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Quic => Arc::new(QuicTransport),
        TransportKind::H3 => Arc::new(Http3Transport),
    }
}

/// Framing position of a physical connection.
///
/// Only the boundary states (`Connected`, `AwaitingHeader`, `AckPending`)
/// allow a new frame operation to start. An operation that is abandoned
/// half way leaves the connection in a non-boundary state, so the next
/// operation fails instead of misreading leftover bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake written, no message traffic yet
    Connected,
    /// Previous message finished and acked
    AwaitingHeader,
    /// A header frame is being read
    ReadingHeader,
    /// A message body is being read
    StreamingBody,
    /// A message body is being discarded
    Discarding,
    /// Body drained; an ack may follow
    AckPending,
    /// An ack frame is being written
    Acking,
    /// A message is being written
    Producing,
    /// Closed by the caller
    Closed,
    /// Framing lost after an error
    Broken,
}

impl ConnectionState {
    /// Whether a new frame operation may start here
    pub fn is_boundary(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::AwaitingHeader | ConnectionState::AckPending
        )
    }
}

/// Handles that keep a physical connection alive
pub(crate) enum Link {
    /// Raw QUIC stream
    Quic(quic::QuicLink),
    /// HTTP/3 request tunnel
    Http3(http3::Http3Link),
    /// In-process pipe
    Memory,
    /// Already torn down
    Released,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Link::Quic(_) => "Quic",
            Link::Http3(_) => "Http3",
            Link::Memory => "Memory",
            Link::Released => "Released",
        };
        f.write_str(kind)
    }
}

impl Link {
    async fn release(&mut self, reader: &mut BufReader<BoxedRead>) -> Result<(), SessionError> {
        match std::mem::replace(self, Link::Released) {
            Link::Quic(link) => {
                link.close(reader).await;
                Ok(())
            }
            Link::Http3(link) => link.close().await,
            Link::Memory | Link::Released => Ok(()),
        }
    }
}

/// One physical duplex stream
pub struct Connection {
    reader: BufReader<BoxedRead>,
    writer: BufWriter<BoxedWrite>,
    link: Link,
    state: ConnectionState,
}

impl Connection {
    pub(crate) fn new(reader: BoxedRead, writer: BoxedWrite, link: Link) -> Self {
        Self {
            reader: BufReader::with_capacity(STREAM_BUFFER_SIZE, reader),
            writer: BufWriter::with_capacity(STREAM_BUFFER_SIZE, writer),
            link,
            state: ConnectionState::Connected,
        }
    }

    /// Wrap an in-process duplex stream
    pub fn from_duplex(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self::new(Box::new(read), Box::new(write), Link::Memory)
    }

    /// Current framing position
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn mark_broken(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Broken;
        }
    }

    /// Fail unless a new frame operation may start
    pub(crate) fn ensure_boundary(&self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Closed => Err(SessionError::Closed),
            state if state.is_boundary() => Ok(()),
            state => Err(SessionError::Broken(state)),
        }
    }

    /// Buffered read side
    pub fn reader_mut(&mut self) -> &mut BufReader<BoxedRead> {
        &mut self.reader
    }

    /// Buffered write side
    pub fn writer_mut(&mut self) -> &mut BufWriter<BoxedWrite> {
        &mut self.writer
    }

    /// Wait until the peer accepted the stream.
    ///
    /// Only the HTTP/3 binding has anything to wait for: the response
    /// status of the tunnel request.
    pub async fn accept(&mut self) -> Result<(), SessionError> {
        match &mut self.link {
            Link::Http3(link) => link.accept().await,
            _ => Ok(()),
        }
    }

    /// Flush, shut down the write side and release the transport.
    /// Calling it again is a no-op.
    ///
    /// A broken connection is not flushed: its buffered bytes are the
    /// remains of an unfinished frame and the peer may have stopped reading.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if matches!(self.link, Link::Released) {
            return Ok(());
        }
        let shutdown = if self.state == ConnectionState::Broken {
            self.writer.get_mut().shutdown().await
        } else {
            self.writer.shutdown().await
        };
        self.state = ConnectionState::Closed;
        let released = self.link.release(&mut self.reader).await;
        debug!("Connection closed");
        shutdown.map_err(loom_wire::WireError::from)?;
        released
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("link", &self.link)
            .finish()
    }
}

/// In-process transport: every `open` creates a duplex pipe and hands the
/// far end to whoever holds the receiver.
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<DuplexStream>,
    capacity: usize,
}

impl MemoryTransport {
    /// Create the transport and the receiver for the peer ends
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        (Self { peers, capacity }, accepted)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _options: &ClientOptions) -> Result<Connection, SessionError> {
        let (client, server) = tokio::io::duplex(self.capacity);
        self.peers
            .send(server)
            .map_err(|_| SessionError::Transport(anyhow::anyhow!("memory listener closed")))?;
        Ok(Connection::from_duplex(client))
    }
}
