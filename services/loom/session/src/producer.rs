//! Producer sessions.

use bytes::Bytes;
use loom_wire::{write_chunk, write_end_of_message, write_message_header, MessageHeader, Role, WireError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::options::ClientOptions;
use crate::reconnect::Checkpoint;
use crate::session::{cancellable, live, SessionCore};
use crate::transport::{transport_for, Connection, ConnectionState, Transport};
use crate::SessionError;

/// Chunk size used when the caller passes 0
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Attempts `produce_retrying` makes for one message
pub const PRODUCE_ATTEMPTS: u32 = 3;

/// Streams messages into a room
pub struct Producer {
    core: SessionCore,
}

impl Producer {
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
        let core = SessionCore::connect(Role::Producer, options, transport, cancel).await?;
        Ok(Self { core })
    }

    /// Effective options, role defaults applied
    pub fn options(&self) -> &ClientOptions {
        self.core.options()
    }

    /// Stream one message: header, one chunk per non-empty read of `body`,
    /// terminator, flush. Returns the number of body bytes sent.
    ///
    /// `declared_size` is passed through as-is. Any failure after the header
    /// started leaves the connection broken until [`Producer::recover`].
    pub async fn produce<R>(
        &self,
        cancel: &CancellationToken,
        key: &[u8],
        declared_size: u64,
        msg_id: u64,
        body: &mut R,
        chunk_size: usize,
    ) -> Result<u64, SessionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if key.is_empty() {
            return Err(WireError::EmptyKey.into());
        }
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };

        let mut slot = self.core.slot.lock().await;
        let connection = live(&mut slot)?;
        connection.ensure_boundary()?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        connection.set_state(ConnectionState::Producing);

        let header = MessageHeader {
            key: Bytes::copy_from_slice(key),
            declared_size,
            msg_id,
        };
        let result = cancellable(cancel, write_message(connection, &header, body, chunk_size)).await;
        match result {
            Ok(sent) => {
                connection.set_state(ConnectionState::Connected);
                debug!("Produced message {} ({} bytes)", msg_id, sent);
                Ok(sent)
            }
            Err(e) => {
                connection.mark_broken();
                Err(e)
            }
        }
    }

    /// Like [`Producer::produce`], but on a connection failure reconnects,
    /// rewinds `body` and sends the whole message again, up to
    /// [`PRODUCE_ATTEMPTS`] times. A body whose position cannot be saved or
    /// restored is not retried.
    pub async fn produce_retrying<R>(
        &self,
        cancel: &CancellationToken,
        key: &[u8],
        declared_size: u64,
        msg_id: u64,
        body: &mut R,
        chunk_size: usize,
    ) -> Result<u64, SessionError>
    where
        R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    {
        let checkpoint = Checkpoint::take(body).await;
        let mut attempt = 1;
        loop {
            let err = match self
                .produce(cancel, key, declared_size, msg_id, body, chunk_size)
                .await
            {
                Ok(sent) => return Ok(sent),
                Err(e) => e,
            };
            if !err.is_connection_fatal() || attempt >= PRODUCE_ATTEMPTS {
                return Err(err);
            }
            let Some(checkpoint) = checkpoint else {
                return Err(err);
            };
            if !checkpoint.rewind(body).await {
                return Err(err);
            }

            warn!(
                "Producing message {} failed (attempt {}): {}; reconnecting",
                msg_id, attempt, err
            );
            self.recover(cancel).await?;
            attempt += 1;
        }
    }

    /// Replace the connection per the reconnect policy
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.core.recover(cancel).await
    }

    /// Flush and close; for HTTP/3 this also reports a refused tunnel
    pub async fn close(&self) -> Result<(), SessionError> {
        self.core.close().await
    }
}

async fn write_message<R>(
    connection: &mut Connection,
    header: &MessageHeader,
    body: &mut R,
    chunk_size: usize,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let writer = connection.writer_mut();
    write_message_header(writer, header).await?;

    let mut buf = vec![0u8; chunk_size];
    let mut sent = 0u64;
    loop {
        let n = body.read(&mut buf).await.map_err(SessionError::Source)?;
        if n == 0 {
            break;
        }
        write_chunk(writer, &buf[..n]).await?;
        sent += n as u64;
    }

    write_end_of_message(writer).await?;
    writer.flush().await.map_err(WireError::from)?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use loom_wire::{read_chunk, read_hello, read_message_header, HelloLimits};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    async fn connected() -> (Producer, tokio::io::DuplexStream) {
        let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
        let producer = Producer::connect_with(
            ClientOptions::new("memory:0"),
            Arc::new(transport),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut peer = accepted.recv().await.unwrap();
        read_hello(&mut peer, &HelloLimits::default()).await.unwrap();
        (producer, peer)
    }

    /// Yields its data in fixed pieces, then fails if asked to
    struct Pieces {
        pieces: Vec<&'static [u8]>,
        fail_at_end: bool,
    }

    impl AsyncRead for Pieces {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.pieces.is_empty() {
                if self.fail_at_end {
                    return Poll::Ready(Err(std::io::Error::other("disk gone")));
                }
                return Poll::Ready(Ok(()));
            }
            let piece = self.pieces.remove(0);
            buf.put_slice(piece);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_one_chunk_per_read() {
        let (producer, mut peer) = connected().await;
        let mut body = Pieces {
            pieces: vec![&b"hello"[..], &b"world"[..]],
            fail_at_end: false,
        };

        let sent = producer
            .produce(&CancellationToken::new(), b"k", 10, 7, &mut body, 0)
            .await
            .unwrap();
        assert_eq!(sent, 10);

        let header = read_message_header(&mut peer, 256).await.unwrap();
        assert_eq!(&header.key[..], b"k");
        assert_eq!(header.declared_size, 10);
        assert_eq!(header.msg_id, 7);
        let first = read_chunk(&mut peer, 1024).await.unwrap().unwrap();
        let second = read_chunk(&mut peer, 1024).await.unwrap().unwrap();
        assert_eq!((&first[..], &second[..]), (&b"hello"[..], &b"world"[..]));
        assert!(read_chunk(&mut peer, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_size_splits_reads() {
        let (producer, mut peer) = connected().await;
        let mut body: &[u8] = b"abcdefg";

        producer
            .produce(&CancellationToken::new(), b"k", 0, 1, &mut body, 3)
            .await
            .unwrap();

        read_message_header(&mut peer, 256).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = read_chunk(&mut peer, 1024).await.unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec![&b"abc"[..], &b"def"[..], &b"g"[..]]);
    }

    #[tokio::test]
    async fn test_empty_key_rejected_without_breaking() {
        let (producer, _peer) = connected().await;
        let mut body: &[u8] = b"x";
        let err = producer
            .produce(&CancellationToken::new(), b"", 1, 1, &mut body, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Wire(WireError::EmptyKey)));

        let mut body: &[u8] = b"x";
        producer
            .produce(&CancellationToken::new(), b"k", 1, 2, &mut body, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_source_failure_breaks_connection() {
        let (producer, _peer) = connected().await;
        let mut body = Pieces {
            pieces: vec![&b"partial"[..]],
            fail_at_end: true,
        };
        let err = producer
            .produce(&CancellationToken::new(), b"k", 0, 1, &mut body, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Source(_)));

        let mut next: &[u8] = b"x";
        let err = producer
            .produce(&CancellationToken::new(), b"k", 0, 2, &mut next, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Broken(ConnectionState::Broken)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_connection() {
        let (producer, mut peer) = connected().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut body: &[u8] = b"never sent";
        let err = producer
            .produce(&cancel, b"k", 0, 1, &mut body, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));

        let mut body: &[u8] = b"sent";
        producer
            .produce(&CancellationToken::new(), b"k", 4, 2, &mut body, 0)
            .await
            .unwrap();
        let header = read_message_header(&mut peer, 256).await.unwrap();
        assert_eq!(header.msg_id, 2);
    }

    #[tokio::test]
    async fn test_recover_after_cancel_with_stalled_peer() {
        let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
        let producer = Producer::connect_with(
            ClientOptions::new("memory:0"),
            Arc::new(transport),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        // Alive but never read from
        let _stalled = accepted.recv().await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let big = vec![0u8; 1024 * 1024];
        let err = producer
            .produce(&cancel, b"k", big.len() as u64, 1, &mut &big[..], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));

        tokio::time::timeout(
            std::time::Duration::from_secs(3),
            producer.recover(&CancellationToken::new()),
        )
        .await
        .expect("recover waited on the stalled connection")
        .unwrap();

        let mut fresh = accepted.recv().await.unwrap();
        read_hello(&mut fresh, &HelloLimits::default()).await.unwrap();
        let mut body: &[u8] = b"again";
        producer
            .produce(&CancellationToken::new(), b"k", 5, 2, &mut body, 0)
            .await
            .unwrap();
        assert_eq!(read_message_header(&mut fresh, 256).await.unwrap().msg_id, 2);
    }

    #[tokio::test]
    async fn test_produce_after_close() {
        let (producer, _peer) = connected().await;
        producer.close().await.unwrap();
        producer.close().await.unwrap();

        let mut body: &[u8] = b"x";
        let err = producer
            .produce(&CancellationToken::new(), b"k", 0, 1, &mut body, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }
}
