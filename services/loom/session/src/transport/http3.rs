//! HTTP/3 binding.
//!
//! The session is tunneled through a single `POST https://{addr}/stream`
//! request: the request body carries client frames and the response body
//! carries broker frames. Two pump tasks bridge the h3 request stream to
//! in-process pipes so the session sees an ordinary duplex stream.

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h3::client::{RequestStream, SendRequest};
use std::future::poll_fn;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::quic::dial;
use super::{Connection, Link, Transport, CLOSE_GRACE, STREAM_BUFFER_SIZE};
use crate::options::ClientOptions;
use crate::tls::ALPN_H3;
use crate::SessionError;

/// Request path of the tunnel
pub const STREAM_PATH: &str = "/stream";

/// Most of an error response body kept for the error message
const MAX_ERROR_BODY: usize = 64 * 1024;

type StatusResult = Result<(), SessionError>;

/// Tunnels the session through an HTTP/3 request
pub struct Http3Transport;

#[async_trait]
impl Transport for Http3Transport {
    async fn open(&self, options: &ClientOptions) -> Result<Connection, SessionError> {
        let (endpoint, connection) = dial(options, ALPN_H3).await?;

        let (mut driver, mut requests) = h3::client::new(h3_quinn::Connection::new(connection.clone()))
            .await
            .map_err(|e| transport_error(e, "HTTP/3 setup failed"))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = poll_fn(|cx| driver.poll_close(cx)).await {
                debug!("HTTP/3 connection ended: {}", e);
            }
        });

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("https://{}{}", options.addr, STREAM_PATH))
            .body(())
            .context("Failed to build tunnel request")
            .map_err(SessionError::Transport)?;
        let stream = match requests.send_request(request).await {
            Ok(stream) => stream,
            Err(e) => {
                driver.abort();
                connection.close(quinn::VarInt::from_u32(0), b"");
                return Err(transport_error(e, "Failed to send tunnel request"));
            }
        };
        info!("Opened HTTP/3 tunnel to {}{}", options.addr, STREAM_PATH);

        let (send, recv) = stream.split();
        let (client_read, response_sink) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (request_source, client_write) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let (status_tx, status_rx) = oneshot::channel();

        let writer = tokio::spawn(pump_request(request_source, send));
        let reader = tokio::spawn(pump_response(recv, response_sink, status_tx));

        Ok(Connection::new(
            Box::new(client_read),
            Box::new(client_write),
            Link::Http3(Http3Link {
                endpoint,
                connection,
                _requests: requests,
                driver,
                writer,
                reader,
                status: Some(status_rx),
            }),
        ))
    }
}

/// Tasks and handles behind one tunnel
pub(crate) struct Http3Link {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    _requests: SendRequest<h3_quinn::OpenStreams, Bytes>,
    driver: JoinHandle<()>,
    writer: JoinHandle<Result<(), SessionError>>,
    reader: JoinHandle<()>,
    status: Option<oneshot::Receiver<StatusResult>>,
}

impl Http3Link {
    /// Wait for the response status; only the first call waits
    pub(crate) async fn accept(&mut self) -> Result<(), SessionError> {
        match self.status.take() {
            Some(status) => status.await.unwrap_or_else(|_| {
                Err(SessionError::Transport(anyhow::anyhow!(
                    "tunnel closed before a response arrived"
                )))
            }),
            None => Ok(()),
        }
    }

    /// Finish the request body, confirm the status if nobody has yet, and
    /// tear the connection down.
    pub(crate) async fn close(mut self) -> Result<(), SessionError> {
        let mut result = match tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await {
            Ok(Ok(flushed)) => flushed,
            Ok(Err(e)) => Err(SessionError::Transport(
                anyhow::Error::new(e).context("request pump failed"),
            )),
            Err(_) => {
                warn!("Request body not finished within {:?}", CLOSE_GRACE);
                Ok(())
            }
        };

        if self.status.is_some() {
            match tokio::time::timeout(CLOSE_GRACE, self.accept()).await {
                Ok(status) => result = status.and(result),
                Err(_) => warn!("No tunnel response within {:?}", CLOSE_GRACE),
            }
        }

        self.connection.close(quinn::VarInt::from_u32(0), b"client closing");
        let _ = tokio::time::timeout(CLOSE_GRACE, self.endpoint.wait_idle()).await;
        result
    }
}

impl Drop for Http3Link {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        self.driver.abort();
    }
}

fn transport_error(e: h3::Error, context: &'static str) -> SessionError {
    SessionError::Transport(anyhow::Error::new(e).context(context))
}

/// Copy client frames from the pipe into the request body; finish the body
/// once the pipe reaches EOF.
async fn pump_request<S>(
    mut source: DuplexStream,
    mut send: RequestStream<S, Bytes>,
) -> Result<(), SessionError>
where
    S: h3::quic::SendStream<Bytes>,
{
    let mut buf = BytesMut::with_capacity(STREAM_BUFFER_SIZE);
    loop {
        buf.reserve(STREAM_BUFFER_SIZE);
        let n = source.read_buf(&mut buf).await.map_err(loom_wire::WireError::from)?;
        if n == 0 {
            break;
        }
        send.send_data(buf.split().freeze())
            .await
            .map_err(|e| transport_error(e, "Failed to send request body"))?;
    }
    send.finish()
        .await
        .map_err(|e| transport_error(e, "Failed to finish request body"))
}

/// Report the response status, then copy the response body into the pipe.
/// Dropping the pipe is how EOF reaches the session.
async fn pump_response<S>(
    mut recv: RequestStream<S, Bytes>,
    mut sink: DuplexStream,
    status: oneshot::Sender<StatusResult>,
) where
    S: h3::quic::RecvStream,
{
    let response = match recv.recv_response().await {
        Ok(response) => response,
        Err(e) => {
            let _ = status.send(Err(transport_error(e, "No tunnel response")));
            return;
        }
    };

    let code = response.status();
    if !code.is_success() {
        let body = read_error_body(&mut recv).await;
        warn!("Tunnel refused with status {}", code);
        let _ = status.send(tunnel_status(code, &body));
        return;
    }
    debug!("Tunnel accepted with status {}", code);
    let _ = status.send(tunnel_status(code, &[]));

    loop {
        match recv.recv_data().await {
            Ok(Some(mut chunk)) => {
                let data = chunk.copy_to_bytes(chunk.remaining());
                if sink.write_all(&data).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Response body failed: {}", e);
                return;
            }
        }
    }
}

/// Any 2xx accepts the tunnel; everything else refuses it with the
/// trimmed response body as the reason.
fn tunnel_status(code: http::StatusCode, body: &[u8]) -> StatusResult {
    if code.is_success() {
        return Ok(());
    }
    Err(SessionError::TransportEstablishment {
        status: code.as_u16(),
        body: String::from_utf8_lossy(body).trim().to_string(),
    })
}

async fn read_error_body<S>(recv: &mut RequestStream<S, Bytes>) -> Vec<u8>
where
    S: h3::quic::RecvStream,
{
    let mut body = Vec::new();
    while body.len() < MAX_ERROR_BODY {
        match recv.recv_data().await {
            Ok(Some(mut chunk)) => {
                let take = chunk.remaining().min(MAX_ERROR_BODY - body.len());
                body.extend_from_slice(&chunk.copy_to_bytes(take));
            }
            _ => break,
        }
    }
    body
}
