use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    entry::KvEntry,
    error::StateError,
    state::Submit,
    transport::Connection,
};

/// Reads proposed mutations from one writer and forwards them to `sink`.
///
/// The writer's sequence field is ignored. Proposals with an empty key are
/// logged and skipped; a malformed message ends the connection. Returns the
/// number of proposals that were sequenced.
pub async fn ingest<S, W>(
    conn: &mut Connection<S>,
    sink: &W,
    shutdown: &CancellationToken,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Submit,
{
    let mut accepted = 0;
    loop {
        let message = select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = conn.recv() => message.context("failed to read proposal")?,
        };
        let Some(frames) = message else {
            break;
        };

        let proposal = KvEntry::from_frames(frames).context("malformed proposal")?;
        match sink.submit(proposal.key, proposal.body).await {
            Ok(sequence) => {
                accepted += 1;
                debug!(sequence, "proposal sequenced");
            }
            Err(StateError::EmptyKey) => warn!("dropped proposal with an empty key"),
            Err(err @ StateError::Closed) => return Err(err.into()),
        }
    }

    Ok(accepted)
}

/// Write side of the collector channel, used by subscribers and one-shot
/// producers.
pub struct CollectorClient<S = TcpStream> {
    conn: Connection<S>,
}

impl CollectorClient<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let conn = Connection::connect(addr)
            .await
            .with_context(|| format!("failed to connect to collector at {addr}"))?;
        info!("connected collector socket to {}", addr);
        Ok(Self { conn })
    }
}

impl<S> CollectorClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: Connection<S>) -> Self {
        Self { conn }
    }

    /// Fire-and-forget: the publisher assigns the sequence and nothing is
    /// sent back.
    pub async fn push(&mut self, key: impl Into<String>, body: impl Into<Bytes>) -> Result<()> {
        let proposal = KvEntry::new(key, body);
        self.conn
            .send(proposal.into_frames())
            .await
            .context("failed to push update to collector")
    }

    pub async fn close(mut self) -> Result<()> {
        self.conn
            .close()
            .await
            .context("failed to close collector connection")
    }
}
