use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    entry::{KvEntry, SNAPSHOT_REQUEST},
    error::ProtocolError,
    state::PublisherHandle,
    transport::{Connection, Multipart},
};

/// Answers snapshot requests on one requester's connection.
///
/// Each request is answered with every stored entry followed by the
/// sentinel carrying the low-water mark. Any request other than
/// [`SNAPSHOT_REQUEST`] ends the exchange with an error.
pub async fn serve_snapshots<S>(
    conn: &mut Connection<S>,
    state: &PublisherHandle,
    peer: u64,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request = select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = conn.recv() => request.context("failed to read snapshot request")?,
        };
        let Some(request) = request else {
            debug!(peer, "snapshot requester disconnected");
            break;
        };

        if let Err(err) = check_request(&request) {
            error!(peer, error = %err, "bad request, aborting");
            return Err(err.into());
        }

        let snapshot = state.snapshot().await?;
        let entries = snapshot.entries.len();
        info!(peer, entries, "sending state snapshot={}", snapshot.sequence);

        let messages = snapshot
            .entries
            .into_iter()
            .chain(std::iter::once(KvEntry::sentinel(snapshot.sequence)))
            .map(KvEntry::into_frames);
        select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(peer, "snapshot transfer abandoned on shutdown");
                break;
            }
            sent = conn.send_batch(messages) => sent.context("failed to send snapshot")?,
        }
    }

    Ok(())
}

fn check_request(request: &Multipart) -> Result<(), ProtocolError> {
    match request.as_slice() {
        [token] if token.as_ref() == SNAPSHOT_REQUEST => Ok(()),
        frames => Err(ProtocolError::BadRequest(
            frames
                .iter()
                .map(|frame| String::from_utf8_lossy(frame).into_owned())
                .collect::<Vec<_>>()
                .join("|"),
        )),
    }
}
