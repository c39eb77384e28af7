use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::broadcast,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{entry::KvEntry, error::PublishError, transport::Connection};

/// Greeting sent on a live-update connection once it is registered with the
/// bus. Anything sequenced after the subscriber reads it will reach them.
pub const READY: &[u8] = b"READY";

pub const BUS_CAPACITY: usize = 1024;

/// Fan-out of sequenced updates to every connected subscriber.
#[derive(Debug, Clone)]
pub struct UpdateBus {
    sender: broadcast::Sender<KvEntry>,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many subscribers the update was queued for.
    pub fn publish(&self, entry: KvEntry) -> Result<usize, PublishError> {
        if entry.is_sentinel() {
            return Err(PublishError::Sentinel);
        }
        self.sender
            .send(entry)
            .map_err(|_| PublishError::NoSubscribers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KvEntry> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

/// Streams bus updates to one subscriber connection until shutdown or until
/// the subscriber goes away.
///
/// `updates` must already be subscribed so nothing published between
/// accepting the connection and the greeting is lost.
pub async fn serve_subscriber<S>(
    conn: &mut Connection<S>,
    mut updates: broadcast::Receiver<KvEntry>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        greeted = conn.send(vec![Bytes::from_static(READY)]) => {
            greeted.context("failed to greet subscriber")?;
        }
    }

    loop {
        select! {
            biased;
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Ok(entry) => {
                    let sequence = entry.sequence;
                    // A subscriber that stops reading must not hold up shutdown.
                    select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        sent = conn.send(entry.into_frames()) => {
                            sent.with_context(|| format!("failed to deliver update {sequence}"))?;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber fell behind; updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("update bus closed");
                    break;
                }
            },
        }
    }

    Ok(())
}
