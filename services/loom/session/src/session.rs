//! Shared core of producer and consumer sessions.
//!
//! A session owns at most one live connection, kept in a mutex-guarded slot.
//! Every operation holds the slot lock for its whole duration and the
//! reconnect supervisor replaces the connection under the same lock.

use loom_wire::Role;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handshake::establish;
use crate::options::ClientOptions;
use crate::reconnect;
use crate::transport::{Connection, Transport};
use crate::SessionError;

pub(crate) struct SessionCore {
    role: Role,
    options: ClientOptions,
    transport: Arc<dyn Transport>,
    pub(crate) slot: Mutex<Option<Connection>>,
}

impl SessionCore {
    pub(crate) async fn connect(
        role: Role,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let options = options.with_role_defaults(role);
        options.validate()?;
        let connection = cancellable(cancel, establish(transport.as_ref(), &options, role)).await?;
        Ok(Self {
            role,
            options,
            transport,
            slot: Mutex::new(Some(connection)),
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) async fn recover(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        reconnect::recover(&self.options.reconnect, &self.slot, cancel, || {
            establish(self.transport.as_ref(), &self.options, self.role)
        })
        .await
    }

    pub(crate) async fn close(&self) -> Result<(), SessionError> {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(mut connection) => {
                debug!("Closing {:?} session to {}", self.role, self.options.addr);
                connection.close().await
            }
            None => Ok(()),
        }
    }
}

/// Live connection in `slot`, or `Closed` once the session was closed
pub(crate) fn live(slot: &mut Option<Connection>) -> Result<&mut Connection, SessionError> {
    slot.as_mut().ok_or(SessionError::Closed)
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => result,
    }
}
