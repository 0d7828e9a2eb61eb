//! Reconnect supervisor.
//!
//! Recovery is connection-level: the broken connection is closed and a new
//! one is established with the same identity. Messages in flight at the time
//! of the failure are not replayed here; `Checkpoint` lets a producer rewind
//! its own body and send it again.

use std::future::Future;
use std::io::SeekFrom;
use tokio::io::{AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::options::ReconnectPolicy;
use crate::transport::{Connection, CLOSE_GRACE};
use crate::SessionError;

/// Replace the connection in `slot` with a freshly established one.
///
/// The slot stays locked for the whole recovery, so no other operation can
/// observe a half-replaced connection. Closing the old connection is best
/// effort and bounded by [`CLOSE_GRACE`]. With `max_retries = N > 0` exactly N
/// attempts are made, separated by N-1 sleeps of the policy delay.
pub async fn recover<F, Fut>(
    policy: &ReconnectPolicy,
    slot: &Mutex<Option<Connection>>,
    cancel: &CancellationToken,
    mut establish: F,
) -> Result<(), SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Connection, SessionError>>,
{
    if !policy.enabled {
        return Err(SessionError::ReconnectDisabled);
    }

    let mut slot = slot.lock().await;
    if let Some(mut old) = slot.take() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            closed = tokio::time::timeout(CLOSE_GRACE, old.close()) => match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Closing the old connection failed: {}", e),
                Err(_) => warn!("Old connection not closed within {:?}; dropping it", CLOSE_GRACE),
            },
        }
    }

    let delay = policy.effective_delay();
    let mut attempts: u32 = 0;
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            attempt = establish() => attempt,
        };

        match attempt {
            Ok(connection) => {
                *slot = Some(connection);
                info!("Reconnected after {} failed attempt(s)", attempts);
                return Ok(());
            }
            Err(e) => {
                attempts += 1;
                if policy.max_retries > 0 && attempts >= policy.max_retries {
                    warn!("Giving up after {} reconnect attempt(s): {}", attempts, e);
                    return Err(e);
                }
                warn!(
                    "Reconnect attempt {} failed: {}; retrying in {:?}",
                    attempts, e, delay
                );
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Saved position of a seekable body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    position: u64,
}

impl Checkpoint {
    /// Record the current position; `None` when the source cannot report it
    pub async fn take<S: AsyncSeek + Unpin + ?Sized>(source: &mut S) -> Option<Self> {
        source
            .stream_position()
            .await
            .ok()
            .map(|position| Self { position })
    }

    /// Seek back to the recorded position
    pub async fn rewind<S: AsyncSeek + Unpin + ?Sized>(&self, source: &mut S) -> bool {
        source.seek(SeekFrom::Start(self.position)).await.is_ok()
    }

    /// Recorded offset
    pub fn position(&self) -> u64 {
        self.position
    }
}
