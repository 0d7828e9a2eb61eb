//! Consumer sessions.
//!
//! A [`Message`] returned by [`Consumer::next`] keeps the session's
//! connection locked until it is dropped, so nothing else can read from or
//! write to the stream while a body is in flight. Dropping a message before
//! its body reached the terminator leaves the connection broken; the next
//! call fails instead of reading body bytes as a header.

use async_trait::async_trait;
use bytes::Bytes;
use loom_wire::{read_message_header, write_ack, BodyReader, MessageHeader, Role, WireError};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::options::ClientOptions;
use crate::session::{cancellable, live, SessionCore};
use crate::transport::{transport_for, Connection, ConnectionState, Transport};
use crate::SessionError;

/// Handles one message at a time for [`Consumer::consume`]
#[async_trait]
pub trait MessageHandler: Send {
    /// Process `message`. The body may be read partially or not at all;
    /// whatever is left is drained afterwards. Returning an error stops
    /// consumption without acking the message.
    async fn handle(&mut self, message: &mut Message<'_>) -> anyhow::Result<()>;
}

/// Receives messages from a room
pub struct Consumer {
    core: SessionCore,
}

impl Consumer {
    /// Connect over the transport named in `options`
    pub async fn connect(options: ClientOptions, cancel: &CancellationToken) -> Result<Self, SessionError> {
        let transport = transport_for(options.transport);
        Self::connect_with(options, transport, cancel).await
    }

    /// Connect over an explicit transport
    pub async fn connect_with(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let core = SessionCore::connect(Role::Consumer, options, transport, cancel).await?;
        Ok(Self { core })
    }

    /// Effective options, role defaults applied
    pub fn options(&self) -> &ClientOptions {
        self.core.options()
    }

    /// Read the next message header.
    ///
    /// Fails with [`SessionError::Broken`] when the previous message was
    /// abandoned mid-body.
    pub async fn next(&self) -> Result<Message<'_>, SessionError> {
        let mut guard = self.core.slot.lock().await;
        let limits = self.core.options().limits;

        let connection = live(&mut guard)?;
        connection.ensure_boundary()?;
        connection.set_state(ConnectionState::ReadingHeader);

        match read_message_header(connection.reader_mut(), limits.max_key).await {
            Ok(header) => {
                connection.set_state(ConnectionState::StreamingBody);
                debug!(
                    "Message {} key={:?} declared_size={}",
                    header.msg_id,
                    String::from_utf8_lossy(&header.key),
                    header.declared_size
                );
                Ok(Message::new(header, LiveStream { guard }, limits.max_chunk))
            }
            Err(e) => {
                connection.mark_broken();
                Err(e.into())
            }
        }
    }

    /// Hand messages to `handler` until cancelled or a frame fails.
    ///
    /// Every body is drained after the handler returns. A handler error is
    /// returned after the drain attempt, even when the drain itself failed,
    /// and the message is not acked; otherwise the message is acked and the
    /// loop continues.
    pub async fn consume<H>(&self, cancel: &CancellationToken, handler: &mut H) -> Result<(), SessionError>
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let mut message = cancellable(cancel, self.next()).await?;

            let handled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                handled = handler.handle(&mut message) => Some(handled),
            };
            let Some(handled) = handled else {
                message.mark_broken();
                return Err(SessionError::Cancelled);
            };

            let drained = cancellable(cancel, message.drain()).await;
            if let Err(e) = handled {
                warn!("Handler rejected message {}: {:#}", message.msg_id, e);
                if let Err(drain_error) = drained {
                    warn!("Message {} not drained: {}", message.msg_id, drain_error);
                    message.mark_broken();
                }
                return Err(SessionError::Handler(e));
            }
            if let Err(e) = drained {
                message.mark_broken();
                return Err(e);
            }

            let acked = cancellable(cancel, message.ack()).await;
            if let Err(e) = acked {
                message.mark_broken();
                return Err(e);
            }
        }
    }

    /// [`Consumer::consume`], recovering from connection-level failures.
    /// Handler errors and cancellation are returned to the caller.
    pub async fn consume_with_reconnect<H>(
        &self,
        cancel: &CancellationToken,
        handler: &mut H,
    ) -> Result<(), SessionError>
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            match self.consume(cancel, handler).await {
                Err(e) if e.is_connection_fatal() => {
                    warn!("Consume interrupted: {}; reconnecting", e);
                    self.recover(cancel).await?;
                }
                other => return other,
            }
        }
    }

    /// Replace the connection per the reconnect policy
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.core.recover(cancel).await
    }

    /// Close the session
    pub async fn close(&self) -> Result<(), SessionError> {
        self.core.close().await
    }
}

/// Copy the rest of `message`'s body into `sink`, then ack it
pub async fn drain_and_ack<W>(message: &mut Message<'_>, sink: &mut W) -> Result<u64, SessionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = message.copy_to(sink).await?;
    message.ack().await?;
    Ok(copied)
}

/// Read side of the locked connection
pub struct LiveStream<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
}

impl LiveStream<'_> {
    fn connection(&mut self) -> Option<&mut Connection> {
        self.guard.as_mut()
    }
}

impl AsyncRead for LiveStream<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().connection() {
            Some(connection) => Pin::new(connection.reader_mut()).poll_read(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

/// One received message
pub struct Message<'a> {
    /// Routing key
    pub key: Bytes,
    /// Size announced by the producer; advisory
    pub declared_size: u64,
    /// Producer-assigned id, echoed verbatim in the ack
    pub msg_id: u64,
    body: BodyReader<LiveStream<'a>>,
    acked: bool,
}

impl<'a> Message<'a> {
    fn new(header: MessageHeader, stream: LiveStream<'a>, max_chunk: usize) -> Self {
        Self {
            key: header.key,
            declared_size: header.declared_size,
            msg_id: header.msg_id,
            body: BodyReader::new(stream, max_chunk),
            acked: false,
        }
    }

    /// Whether the body reached its terminator
    pub fn is_drained(&self) -> bool {
        self.body.is_done()
    }

    /// Read body bytes; 0 once the body ended
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let result = self.body.read(buf).await;
        self.settle(result)
    }

    /// Append the rest of the body to `out`
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, SessionError> {
        let result = self.body.read_to_end(out).await;
        self.settle(result)
    }

    /// Copy the rest of the body into `writer`. A failing `writer` gives
    /// [`SessionError::Sink`] and leaves the connection broken mid-body.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self.body.copy_to(writer).await;
        self.settle(result)
    }

    /// Discard the rest of the body
    pub async fn drain(&mut self) -> Result<u64, SessionError> {
        if self.body.is_done() {
            return Ok(0);
        }
        self.set_state(ConnectionState::Discarding);
        let result = self.body.drain().await;
        self.settle(result)
    }

    /// Acknowledge the message. The body must be fully read or drained
    /// first; acking twice sends one ack.
    pub async fn ack(&mut self) -> Result<(), SessionError> {
        if self.acked {
            return Ok(());
        }
        if !self.body.is_done() {
            return Err(SessionError::Undrained { msg_id: self.msg_id });
        }

        let msg_id = self.msg_id;
        let Some(connection) = self.body.get_mut().connection() else {
            return Err(SessionError::Closed);
        };
        connection.set_state(ConnectionState::Acking);
        match write_ack(connection.writer_mut(), msg_id).await {
            Ok(()) => {
                connection.set_state(ConnectionState::AwaitingHeader);
                self.acked = true;
                debug!("Acked message {}", msg_id);
                Ok(())
            }
            Err(e) => {
                connection.mark_broken();
                Err(e.into())
            }
        }
    }

    pub(crate) fn mark_broken(&mut self) {
        if let Some(connection) = self.body.get_mut().connection() {
            connection.mark_broken();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if let Some(connection) = self.body.get_mut().connection() {
            connection.set_state(state);
        }
    }

    fn settle<T>(&mut self, result: Result<T, WireError>) -> Result<T, SessionError> {
        match result {
            Ok(value) => {
                if self.body.is_done() && !self.acked {
                    self.set_state(ConnectionState::AckPending);
                }
                Ok(value)
            }
            Err(WireError::Sink(e)) => {
                self.mark_broken();
                Err(SessionError::Sink(e))
            }
            Err(e) => {
                self.mark_broken();
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("key", &self.key)
            .field("declared_size", &self.declared_size)
            .field("msg_id", &self.msg_id)
            .field("drained", &self.body.is_done())
            .finish()
    }
}
