//! End-to-end session behaviour against an in-memory broker.

use async_trait::async_trait;
use bytes::Bytes;
use loom_session::{
    drain_and_ack, ClientOptions, ConnectionState, Consumer, MemoryTransport, Message,
    MessageHandler, Producer, ReconnectPolicy, SessionError,
};
use loom_wire::{
    read_ack, read_chunk, read_hello, read_message_header, write_chunk, write_end_of_message,
    write_message_header, Hello, HelloLimits, MessageHeader, Role, WireError,
};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn options() -> ClientOptions {
    let mut options = ClientOptions::new("memory:0");
    options.room = "orders".to_string();
    options.reconnect = ReconnectPolicy {
        enabled: true,
        delay: Duration::from_millis(10),
        max_retries: 3,
    };
    options
}

async fn accept(accepted: &mut UnboundedReceiver<DuplexStream>) -> (DuplexStream, Hello) {
    let mut peer = accepted.recv().await.unwrap();
    let hello = read_hello(&mut peer, &HelloLimits::default()).await.unwrap();
    (peer, hello)
}

async fn connect_consumer() -> (Consumer, DuplexStream, UnboundedReceiver<DuplexStream>) {
    let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
    let consumer = Consumer::connect_with(options(), Arc::new(transport), &CancellationToken::new())
        .await
        .unwrap();
    let (peer, hello) = accept(&mut accepted).await;
    assert_eq!(hello.role, Role::Consumer);
    (consumer, peer, accepted)
}

/// Broker side: send one message split into `chunks`
async fn send_message(peer: &mut DuplexStream, key: &str, msg_id: u64, chunks: &[&[u8]]) {
    let declared_size = chunks.iter().map(|c| c.len() as u64).sum();
    write_message_header(
        peer,
        &MessageHeader {
            key: Bytes::copy_from_slice(key.as_bytes()),
            declared_size,
            msg_id,
        },
    )
    .await
    .unwrap();
    for chunk in chunks {
        write_chunk(peer, chunk).await.unwrap();
    }
    write_end_of_message(peer).await.unwrap();
    peer.flush().await.unwrap();
}

/// Records bodies; fails on keys starting with "bad"
#[derive(Default)]
struct Recorder {
    seen: Vec<(String, Vec<u8>)>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&mut self, message: &mut Message<'_>) -> anyhow::Result<()> {
        let key = String::from_utf8_lossy(&message.key).to_string();
        if key.starts_with("bad") {
            // Leave the body unread; consume has to drain it
            anyhow::bail!("rejected {}", key);
        }
        let mut body = Vec::new();
        message.read_to_end(&mut body).await?;
        self.seen.push((key, body));
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_error_drains_without_ack() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "bad-1", 1, &[b"skip ", b"me"]).await;
    send_message(&mut peer, "good-2", 2, &[b"next"]).await;

    let mut recorder = Recorder::default();
    let err = consumer
        .consume(&CancellationToken::new(), &mut recorder)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Handler(_)));
    assert!(!err.is_connection_fatal());
    assert!(recorder.seen.is_empty());

    // The rejected body was drained, so the next header reads cleanly
    let mut message = consumer.next().await.unwrap();
    assert_eq!(&message.key[..], b"good-2");
    let mut body = Vec::new();
    message.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"next");
    drop(message);

    consumer.close().await.unwrap();
    let mut written = Vec::new();
    peer.read_to_end(&mut written).await.unwrap();
    assert!(written.is_empty(), "no ack expected, got {:?}", written);
}

#[tokio::test]
async fn test_handler_error_wins_over_failed_drain() {
    let (consumer, mut peer, mut accepted) = connect_consumer().await;
    // Body cut off before its terminator
    write_message_header(
        &mut peer,
        &MessageHeader {
            key: Bytes::from_static(b"bad-cut"),
            declared_size: 10,
            msg_id: 1,
        },
    )
    .await
    .unwrap();
    write_chunk(&mut peer, b"abc").await.unwrap();
    peer.flush().await.unwrap();
    drop(peer);

    let mut recorder = Recorder::default();
    let err = consumer
        .consume_with_reconnect(&CancellationToken::new(), &mut recorder)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Handler(_)), "got {:?}", err);
    assert!(accepted.try_recv().is_err(), "rejected message must not trigger a reconnect");

    let err = consumer.next().await.unwrap_err();
    assert!(matches!(err, SessionError::Broken(ConnectionState::Broken)));
}

/// Writer that rejects every byte
struct FullDisk;

impl AsyncWrite for FullDisk {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::Error::other("disk full")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_sink_failure_is_not_connection_fatal() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "k", 3, &[b"payload"]).await;

    let mut message = consumer.next().await.unwrap();
    let err = drain_and_ack(&mut message, &mut FullDisk).await.unwrap_err();
    assert!(matches!(err, SessionError::Sink(_)), "got {:?}", err);
    assert!(!err.is_connection_fatal());
    drop(message);

    // The body was left unfinished, so the stream is unusable
    let err = consumer.next().await.unwrap_err();
    assert!(matches!(err, SessionError::Broken(ConnectionState::Broken)));

    consumer.close().await.unwrap();
    let mut written = Vec::new();
    peer.read_to_end(&mut written).await.unwrap();
    assert!(written.is_empty(), "no ack expected, got {:?}", written);
}

#[tokio::test]
async fn test_consume_acks_each_message() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "a", 5, &[b"hello", b"world"]).await;
    send_message(&mut peer, "b", 6, &[b"!"]).await;
    peer.shutdown().await.unwrap();

    let mut recorder = Recorder::default();
    let err = consumer
        .consume(&CancellationToken::new(), &mut recorder)
        .await
        .unwrap_err();
    assert!(err.is_connection_fatal());

    assert_eq!(
        recorder.seen,
        vec![
            ("a".to_string(), b"helloworld".to_vec()),
            ("b".to_string(), b"!".to_vec())
        ]
    );
    assert_eq!(read_ack(&mut peer).await.unwrap(), 5);
    assert_eq!(read_ack(&mut peer).await.unwrap(), 6);
}

#[tokio::test]
async fn test_empty_body_is_a_message() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "empty", 9, &[]).await;

    let mut message = consumer.next().await.unwrap();
    assert_eq!(message.declared_size, 0);
    assert!(!message.is_drained());
    let mut sink = Vec::new();
    let copied = drain_and_ack(&mut message, &mut sink).await.unwrap();
    assert_eq!(copied, 0);
    assert!(message.is_drained());
    drop(message);

    assert_eq!(read_ack(&mut peer).await.unwrap(), 9);
}

#[tokio::test]
async fn test_ack_requires_drained_body() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "k", 3, &[b"abc"]).await;

    let mut message = consumer.next().await.unwrap();
    let err = message.ack().await.unwrap_err();
    assert!(matches!(err, SessionError::Undrained { msg_id: 3 }));

    message.drain().await.unwrap();
    message.ack().await.unwrap();
    message.ack().await.unwrap();
    drop(message);

    assert_eq!(read_ack(&mut peer).await.unwrap(), 3);
    consumer.close().await.unwrap();
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "second ack must not be written");
}

#[tokio::test]
async fn test_abandoned_message_breaks_connection() {
    let (consumer, mut peer, _accepted) = connect_consumer().await;
    send_message(&mut peer, "k", 1, &[b"first chunk", b"second chunk"]).await;
    send_message(&mut peer, "k", 2, &[b"x"]).await;

    let mut message = consumer.next().await.unwrap();
    let mut partial = [0u8; 4];
    message.read(&mut partial).await.unwrap();
    drop(message);

    let err = consumer.next().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Broken(ConnectionState::StreamingBody)
    ));
    assert!(err.is_connection_fatal());
}

#[tokio::test]
async fn test_cancel_while_waiting_for_header() {
    let (consumer, _peer, _accepted) = connect_consumer().await;
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = consumer
        .consume(&cancel, &mut Recorder::default())
        .await
        .unwrap_err();
    assert!(err.is_cancellation());

    // The header read was interrupted; the connection must be replaced
    let err = consumer.next().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Broken(ConnectionState::ReadingHeader)
    ));
}

#[tokio::test]
async fn test_oversized_chunk_from_broker() {
    let mut options = options();
    options.limits.max_chunk = 4;
    let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
    let consumer = Consumer::connect_with(options, Arc::new(transport), &CancellationToken::new())
        .await
        .unwrap();
    let (mut peer, _) = accept(&mut accepted).await;
    send_message(&mut peer, "k", 1, &[b"too long"]).await;

    let mut message = consumer.next().await.unwrap();
    let err = message.drain().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Wire(WireError::ChunkTooLarge { len: 8, max: 4 })
    ));
}

#[tokio::test]
async fn test_consume_with_reconnect_resumes() {
    let (consumer, mut first, mut accepted) = connect_consumer().await;
    send_message(&mut first, "a", 1, &[b"one"]).await;
    drop(first);

    let broker = tokio::spawn(async move {
        let (mut second, hello) = accept(&mut accepted).await;
        assert_eq!(hello.room, "orders");
        send_message(&mut second, "b", 2, &[b"two"]).await;
        send_message(&mut second, "bad-stop", 3, &[b"end"]).await;
        second
    });

    let mut recorder = Recorder::default();
    let err = consumer
        .consume_with_reconnect(&CancellationToken::new(), &mut recorder)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Handler(_)));
    assert_eq!(
        recorder.seen,
        vec![
            ("a".to_string(), b"one".to_vec()),
            ("b".to_string(), b"two".to_vec())
        ]
    );

    let mut second = broker.await.unwrap();
    assert_eq!(read_ack(&mut second).await.unwrap(), 2);
}

#[tokio::test]
async fn test_reconnect_disabled() {
    let mut options = options();
    options.reconnect = ReconnectPolicy::disabled();
    let (transport, mut accepted) = MemoryTransport::new(1024);
    let consumer = Consumer::connect_with(options, Arc::new(transport), &CancellationToken::new())
        .await
        .unwrap();
    let (peer, _) = accept(&mut accepted).await;
    drop(peer);

    let err = consumer
        .consume_with_reconnect(&CancellationToken::new(), &mut Recorder::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ReconnectDisabled));
}

#[tokio::test]
async fn test_produce_retrying_resends_after_reconnect() {
    let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
    let producer = Producer::connect_with(options(), Arc::new(transport), &CancellationToken::new())
        .await
        .unwrap();
    let (first, hello) = accept(&mut accepted).await;
    assert_eq!(hello.role, Role::Producer);
    assert_eq!(hello.name, "producer");
    drop(first);

    let broker = tokio::spawn(async move {
        let (mut second, _) = accept(&mut accepted).await;
        let header = read_message_header(&mut second, 256).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = read_chunk(&mut second, 1024).await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        (header, body)
    });

    let mut body = Cursor::new(b"payload that must arrive whole".to_vec());
    let sent = producer
        .produce_retrying(&CancellationToken::new(), b"events", 30, 0, &mut body, 8)
        .await
        .unwrap();
    assert_eq!(sent, 30);

    let (header, received) = broker.await.unwrap();
    assert_eq!(&header.key[..], b"events");
    assert_eq!(header.declared_size, 30);
    assert_eq!(received, b"payload that must arrive whole");
    producer.close().await.unwrap();
}
