//! Session error types.

use crate::transport::ConnectionState;
use loom_wire::WireError;
use thiserror::Error;

/// Errors surfaced by producers, consumers and the reconnect supervisor
#[derive(Error, Debug)]
pub enum SessionError {
    /// Frame encoding/decoding or stream I/O failed
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The peer refused the tunneled stream
    #[error("transport establishment failed: {status}: {body}")]
    TransportEstablishment {
        /// HTTP status code
        status: u16,
        /// Response body text
        body: String,
    },

    /// Dialing or stream setup failed
    #[error("transport: {0:#}")]
    Transport(anyhow::Error),

    /// TLS material could not be loaded
    #[error("tls: {0:#}")]
    Tls(anyhow::Error),

    /// Options are unusable
    #[error("invalid options: {0}")]
    Config(String),

    /// The producer's body source failed mid-message
    #[error("body source: {0}")]
    Source(#[source] std::io::Error),

    /// Writing a received body to the caller's writer failed
    #[error("body sink: {0}")]
    Sink(#[source] std::io::Error),

    /// A consume handler rejected the message
    #[error("handler: {0:#}")]
    Handler(anyhow::Error),

    /// Ack requested before the body reached its terminator
    #[error("message {msg_id} acked before its body was drained")]
    Undrained {
        /// Id of the message
        msg_id: u64,
    },

    /// The connection is not at a frame boundary and must be replaced
    #[error("connection unusable ({0:?})")]
    Broken(ConnectionState),

    /// The session was closed
    #[error("session closed")]
    Closed,

    /// Cancelled by the caller
    #[error("cancelled")]
    Cancelled,

    /// Reconnect was requested while the policy disables it
    #[error("reconnect disabled")]
    ReconnectDisabled,
}

impl SessionError {
    /// Cancellation, or a reconnect refused by policy
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SessionError::Cancelled | SessionError::ReconnectDisabled)
    }

    /// True when the physical connection can no longer carry frames and
    /// only a reconnect can continue the session.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            SessionError::Wire(WireError::EmptyKey | WireError::Sink(_)) => false,
            SessionError::Wire(_)
            | SessionError::Transport(_)
            | SessionError::TransportEstablishment { .. }
            | SessionError::Broken(_) => true,
            _ => false,
        }
    }
}
