//! Producer and consumer sessions for loom.
//!
//! A session is one ordered duplex stream to the broker, carried over raw
//! QUIC or tunneled through an HTTP/3 request, on which `loom-wire` frames
//! are exchanged. Producers stream chunked messages into a room; consumers
//! read messages as they arrive and ack each one after its body was drained.
//!
//! ## Features
//!
//! - **Transports**: QUIC (ALPN `loom`), HTTP/3 (`POST /stream`), and an
//!   in-memory pipe for tests and embedding
//! - **Streaming bodies**: message bodies are pulled chunk by chunk straight
//!   from the stream, never buffered whole
//! - **Connection state tracking**: an abandoned message poisons the
//!   connection instead of desynchronising the framing
//! - **Reconnect**: a bounded or unbounded supervisor that swaps in a fresh
//!   connection, plus body rewind for producer retries
//! - **Cancellation**: every blocking operation takes a `CancellationToken`
//!
//! ## Example
//!
//! ```rust,no_run
//! use loom_session::{ClientOptions, Consumer, Message, MessageHandler, Producer};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Print {
//!     async fn handle(&mut self, message: &mut Message<'_>) -> anyhow::Result<()> {
//!         let mut body = Vec::new();
//!         message.read_to_end(&mut body).await?;
//!         println!("{}: {} bytes", message.msg_id, body.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let options = ClientOptions::new("broker.example:4433");
//!
//! let producer = Producer::connect(options.clone(), &cancel).await?;
//! let mut body: &[u8] = b"hello";
//! producer.produce(&cancel, b"greeting", 5, 0, &mut body, 0).await?;
//! producer.close().await?;
//!
//! let consumer = Consumer::connect(options, &cancel).await?;
//! consumer.consume_with_reconnect(&cancel, &mut Print).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod consumer;
pub mod error;
pub mod handshake;
pub mod options;
pub mod producer;
pub mod reconnect;
mod session;
pub mod tls;
pub mod transport;

// Re-export main types
pub use consumer::{drain_and_ack, Consumer, LiveStream, Message, MessageHandler};
pub use error::SessionError;
pub use handshake::{establish, hello_for};
pub use options::{ClientOptions, Limits, ReconnectPolicy, TlsOptions, TransportKind};
pub use producer::{Producer, DEFAULT_CHUNK_SIZE, PRODUCE_ATTEMPTS};
pub use reconnect::{recover, Checkpoint};
pub use transport::{
    transport_for, Connection, ConnectionState, Http3Transport, MemoryTransport, QuicTransport,
    Transport,
};
