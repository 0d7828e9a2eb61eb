//! Loom command line client.
//!
//! Streams a file or stdin into a room as one message, or consumes messages
//! from a room into stdout or a directory.

use anyhow::Context;
use clap::{Parser, Subcommand};
use loom_session::{drain_and_ack, Consumer, Producer, SessionError, DEFAULT_CHUNK_SIZE};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CliOverrides;
use logging::LoomLogFormatter;

/// Loom producer/consumer client
#[derive(Parser, Debug)]
#[command(name = "loom", version, about = "Produce and consume loom messages over QUIC or HTTP/3")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "loom.yaml")]
    config: PathBuf,

    /// Broker address, host:port
    #[arg(long, global = true)]
    addr: Option<String>,

    /// Transport: quic or h3
    #[arg(long, global = true)]
    transport: Option<String>,

    /// TLS server name, defaults to the host part of --addr
    #[arg(long, global = true)]
    server_name: Option<String>,

    /// Skip server certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Client name sent in the handshake
    #[arg(long, global = true)]
    name: Option<String>,

    /// Room to join
    #[arg(long, global = true)]
    room: Option<String>,

    /// Access token sent in the handshake
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one message
    Produce {
        /// Message key
        #[arg(long)]
        key: String,

        /// Body file; stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Message id passed to the broker
        #[arg(long, default_value_t = 0)]
        msg_id: u64,

        /// Largest chunk written to the stream
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Receive messages and ack them
    Consume {
        /// Write each body to a file here instead of stdout
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Stop after this many messages
        #[arg(long)]
        max: Option<u64>,
    },
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            addr: self.addr.clone(),
            transport: self.transport.clone(),
            server_name: self.server_name.clone(),
            insecure: self.insecure,
            name: self.name.clone(),
            room: self.room.clone(),
            token: self.token.clone(),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("loom={}", args.log_level).parse()?)
        .add_directive(format!("loom_session={}", args.log_level).parse()?)
        .add_directive(format!("loom_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(LoomLogFormatter::new("loom".to_string()))
        .init();

    info!("Starting loom client v{}", env!("CARGO_PKG_VERSION"));

    let options = config::resolve(&args.config, &args.overrides())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            on_signal.cancel();
        }
    });

    let result = match args.command {
        Command::Produce {
            key,
            file,
            msg_id,
            chunk_size,
        } => {
            let producer = Producer::connect(options, &cancel).await?;
            let produced = produce(&producer, &cancel, &key, file.as_deref(), msg_id, chunk_size).await;
            let closed = producer.close().await;
            produced.and(closed.map_err(anyhow::Error::from))
        }
        Command::Consume { out_dir, max } => {
            if let Some(dir) = &out_dir {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create {:?}", dir))?;
            }
            let consumer = Consumer::connect(options, &cancel).await?;
            let consumed = consume(&consumer, &cancel, out_dir.as_deref(), max).await;
            let closed = consumer.close().await;
            consumed.and(closed.map_err(anyhow::Error::from))
        }
    };

    match result {
        Err(e) if e.downcast_ref::<SessionError>().is_some_and(SessionError::is_cancellation) => {
            info!("Stopped");
            Ok(())
        }
        other => other,
    }
}

async fn produce(
    producer: &Producer,
    cancel: &CancellationToken,
    key: &str,
    file: Option<&Path>,
    msg_id: u64,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let sent = match file {
        Some(path) => {
            let mut body = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {:?}", path))?;
            let declared_size = body.metadata().await?.len();
            producer
                .produce_retrying(cancel, key.as_bytes(), declared_size, msg_id, &mut body, chunk_size)
                .await?
        }
        None => {
            let mut body = tokio::io::stdin();
            producer
                .produce(cancel, key.as_bytes(), 0, msg_id, &mut body, chunk_size)
                .await?
        }
    };
    component_info!("produce", "Sent {:?} ({} bytes)", key, sent);
    Ok(())
}

async fn consume(
    consumer: &Consumer,
    cancel: &CancellationToken,
    out_dir: Option<&Path>,
    max: Option<u64>,
) -> anyhow::Result<()> {
    let mut received = 0u64;
    while max.map_or(true, |max| received < max) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled.into()),
            outcome = receive_one(consumer, out_dir) => outcome,
        };

        match outcome {
            Ok(()) => received += 1,
            Err(e) if e.is_connection_fatal() => {
                component_warn!("consume", "Connection lost: {}; reconnecting", e);
                consumer.recover(cancel).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!("Received {} message(s)", received);
    Ok(())
}

async fn receive_one(consumer: &Consumer, out_dir: Option<&Path>) -> Result<(), SessionError> {
    let mut message = consumer.next().await?;
    let copied = match out_dir {
        Some(dir) => {
            let path = output_path(dir, message.msg_id, &message.key);
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(SessionError::Sink)?;
            let copied = drain_and_ack(&mut message, &mut file).await?;
            flush(&mut file).await?;
            copied
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let copied = drain_and_ack(&mut message, &mut stdout).await?;
            flush(&mut stdout).await?;
            copied
        }
    };
    component_info!(
        "consume",
        "Message {} {:?} ({} bytes)",
        message.msg_id,
        String::from_utf8_lossy(&message.key),
        copied
    );
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(sink: &mut W) -> Result<(), SessionError> {
    use tokio::io::AsyncWriteExt;
    sink.flush().await.map_err(SessionError::Sink)
}

/// `<dir>/<msg_id>-<key>` with the key reduced to filename-safe characters
fn output_path(dir: &Path, msg_id: u64, key: &[u8]) -> PathBuf {
    let key: String = String::from_utf8_lossy(key)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let key = key.trim_start_matches('.');
    dir.join(format!("{:06}-{}", msg_id, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_sanitizes_key() {
        let dir = Path::new("/tmp/out");
        assert_eq!(
            output_path(dir, 7, b"orders/2024 q1"),
            PathBuf::from("/tmp/out/000007-orders_2024_q1")
        );
        assert_eq!(
            output_path(dir, 12, b"../etc"),
            PathBuf::from("/tmp/out/000012-_etc")
        );
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "loom",
            "--addr",
            "broker:4433",
            "produce",
            "--key",
            "k",
            "--room",
            "orders",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.addr.as_deref(), Some("broker:4433"));
        assert_eq!(overrides.room.as_deref(), Some("orders"));
        match args.command {
            Command::Produce { key, chunk_size, .. } => {
                assert_eq!(key, "k");
                assert_eq!(chunk_size, DEFAULT_CHUNK_SIZE);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
