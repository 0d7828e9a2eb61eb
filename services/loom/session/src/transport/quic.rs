//! Raw QUIC binding: one bidirectional stream per session.

use anyhow::Context;
use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{debug, info};

use super::{BoxedRead, Connection, Link, Transport, CLOSE_GRACE};
use crate::options::ClientOptions;
use crate::tls::{self, ALPN_LOOM};
use crate::SessionError;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Dials the broker and opens one bidirectional stream
pub struct QuicTransport;

#[async_trait]
impl Transport for QuicTransport {
    async fn open(&self, options: &ClientOptions) -> Result<Connection, SessionError> {
        let (endpoint, connection) = dial(options, ALPN_LOOM).await?;
        let (send, recv) = match connection.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                connection.close(VarInt::from_u32(0), b"");
                return Err(SessionError::Transport(
                    anyhow::Error::new(e).context("Failed to open stream"),
                ));
            }
        };
        debug!("Opened stream {} to {}", send.id(), options.addr);

        Ok(Connection::new(
            Box::new(recv),
            Box::new(send),
            Link::Quic(QuicLink {
                endpoint,
                connection,
            }),
        ))
    }
}

/// Resolve `options.addr` and complete a QUIC handshake advertising `alpn`
pub(crate) async fn dial(
    options: &ClientOptions,
    alpn: &[u8],
) -> Result<(Endpoint, quinn::Connection), SessionError> {
    let remote = resolve(&options.addr).await?;
    let tls = tls::client_config(&options.tls, &[alpn]).map_err(SessionError::Tls)?;

    let crypto = QuicClientConfig::try_from(tls)
        .context("QUIC TLS config error")
        .map_err(SessionError::Tls)?;
    let mut client_config = QuinnClientConfig::new(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(
        MAX_IDLE_TIMEOUT
            .try_into()
            .context("invalid idle timeout")
            .map_err(SessionError::Transport)?,
    ));
    client_config.transport_config(Arc::new(transport));

    let bind_addr: SocketAddr = if remote.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = Endpoint::client(bind_addr)
        .context("Failed to bind QUIC endpoint")
        .map_err(SessionError::Transport)?;
    endpoint.set_default_client_config(client_config);

    let server_name = options.server_name();
    debug!("Connecting to {} (SNI: {})", remote, server_name);

    let connecting = endpoint
        .connect(remote, &server_name)
        .with_context(|| format!("Failed to connect to {}", remote))
        .map_err(SessionError::Transport)?;
    let connection = connecting
        .await
        .with_context(|| format!("QUIC handshake with {} failed", remote))
        .map_err(SessionError::Transport)?;

    info!("Connected to {} via QUIC", remote);
    Ok((endpoint, connection))
}

async fn resolve(addr: &str) -> Result<SocketAddr, SessionError> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve {}", addr))
        .map_err(SessionError::Transport)?
        .next()
        .ok_or_else(|| SessionError::Transport(anyhow::anyhow!("no address found for {}", addr)))
}

/// Handles keeping a raw QUIC session alive
pub(crate) struct QuicLink {
    endpoint: Endpoint,
    connection: quinn::Connection,
}

impl QuicLink {
    /// Give the peer a bounded window to finish its side, then close.
    ///
    /// Closing a QUIC connection abandons unacknowledged stream data, so the
    /// read side is drained first; the peer ends it once it consumed ours.
    pub(crate) async fn close(self, reader: &mut BufReader<BoxedRead>) {
        let drained =
            tokio::time::timeout(CLOSE_GRACE, tokio::io::copy(reader, &mut tokio::io::sink())).await;
        if drained.is_err() {
            debug!("Peer did not finish its stream within {:?}", CLOSE_GRACE);
        }
        self.connection.close(VarInt::from_u32(0), b"client closing");
        let _ = tokio::time::timeout(CLOSE_GRACE, self.endpoint.wait_idle()).await;
    }
}
