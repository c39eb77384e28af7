use std::{fmt, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::READY,
    collector::CollectorClient,
    config::{ChannelAddrs, POLL_TIMEOUT, PushArgs, SubArgs, resolve},
    entry::{KvEntry, SNAPSHOT_REQUEST},
    error::ProtocolError,
    replica::{MergeOutcome, Replica},
    supervisor::{Supervisor, TaskExit},
    transport::Connection,
};

const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest silence tolerated between snapshot messages.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// A replica plus its connections to the publisher's snapshot and live
/// update channels.
pub struct Subscriber<S = TcpStream> {
    snapshot: Connection<S>,
    updates: Connection<S>,
    replica: Replica,
}

impl Subscriber<TcpStream> {
    /// Connects the live update channel, then the snapshot channel, and
    /// returns once the publisher has greeted the live connection. Updates
    /// sequenced after this returns are never missed.
    pub async fn connect(addrs: &ChannelAddrs) -> Result<Self> {
        let updates = Connection::connect(addrs.publisher)
            .await
            .with_context(|| format!("failed to connect to publisher at {}", addrs.publisher))?;
        info!("connected publisher socket to {}", addrs.publisher);

        let snapshot = Connection::connect(addrs.snapshot)
            .await
            .with_context(|| format!("failed to connect to snapshot at {}", addrs.snapshot))?;
        info!("connected snapshot socket to {}", addrs.snapshot);

        Self::from_connections(snapshot, updates).await
    }
}

impl<S> Subscriber<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn from_connections(snapshot: Connection<S>, mut updates: Connection<S>) -> Result<Self> {
        await_greeting(&mut updates).await?;
        Ok(Self {
            snapshot,
            updates,
            replica: Replica::new(),
        })
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Requests a snapshot and loads it. Returns the low-water mark.
    pub async fn bootstrap(&mut self) -> Result<u64> {
        self.bootstrap_with_timeout(SNAPSHOT_TIMEOUT).await
    }

    /// Like [`Subscriber::bootstrap`], failing with
    /// [`ProtocolError::SnapshotTimeout`] when the publisher goes quiet for
    /// longer than `wait` mid-transfer.
    pub async fn bootstrap_with_timeout(&mut self, wait: Duration) -> Result<u64> {
        self.snapshot
            .send(vec![Bytes::from_static(SNAPSHOT_REQUEST)])
            .await
            .context("failed to request snapshot")?;

        loop {
            let frames = timeout(wait, self.snapshot.recv())
                .await
                .map_err(|_| ProtocolError::SnapshotTimeout)?
                .context("failed to read snapshot")?
                .ok_or(ProtocolError::PeerClosed)?;
            let entry = KvEntry::from_frames(frames).context("malformed snapshot entry")?;

            if let Some(sequence) = self.replica.load_snapshot(entry)? {
                info!(
                    "received snapshot={} entries={}",
                    sequence,
                    self.replica.store().len()
                );
                return Ok(sequence);
            }
        }
    }

    /// Waits up to `wait` for one live update and merges it.
    ///
    /// `Ok(None)` means nothing arrived in time. Cancel safe.
    pub async fn poll_update(&mut self, wait: Duration) -> Result<Option<MergeOutcome>> {
        let Ok(received) = timeout(wait, self.updates.recv()).await else {
            return Ok(None);
        };
        let frames = received
            .context("failed to read update")?
            .ok_or(ProtocolError::PeerClosed)?;
        let entry = KvEntry::from_frames(frames).context("malformed update")?;

        let sequence = entry.sequence;
        let key = entry.key.clone();
        let outcome = self.replica.apply_update(entry)?;
        match outcome {
            MergeOutcome::Applied => info!("received update={sequence} key={key}"),
            MergeOutcome::Discarded => debug!(sequence, key = %key, "discarded stale update"),
        }
        Ok(Some(outcome))
    }
}

async fn await_greeting<S>(updates: &mut Connection<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = timeout(GREETING_TIMEOUT, updates.recv())
        .await
        .map_err(|_| ProtocolError::MissingGreeting)?
        .context("failed to read update channel greeting")?;
    match greeting.as_deref() {
        Some([frame]) if frame.as_ref() == READY => Ok(()),
        _ => Err(ProtocolError::MissingGreeting.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberRole {
    Poll,
    Generator,
}

impl fmt::Display for SubscriberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriberRole::Poll => "subscriber poll",
            SubscriberRole::Generator => "update generator",
        })
    }
}

/// Runs a subscriber until ctrl-c or until any of its roles stops.
///
/// There is no resync path: losing the publisher after synchronization ends
/// the process with an error.
pub async fn run(args: SubArgs) -> Result<()> {
    let addrs = args.endpoints().resolve().await?;
    let mut subscriber = Subscriber::connect(&addrs).await?;
    subscriber.bootstrap().await?;

    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new();
    supervisor.launch(SubscriberRole::Poll, poll_updates(subscriber, shutdown.clone()));
    if args.generate {
        let collector = CollectorClient::connect(addrs.collector).await?;
        supervisor.launch(
            SubscriberRole::Generator,
            generate_updates(collector, args.interval(), shutdown.clone()),
        );
    }

    let outcome = select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = ?err, "failed to listen for ctrl-c");
            }
            Ok(())
        }
        exit = supervisor.next_exit() => match exit {
            Some(TaskExit { role, result: Err(err) }) => Err(err.context(format!("{role} failed"))),
            Some(TaskExit { role, result: Ok(()) }) => Err(anyhow!("{role} stopped unexpectedly")),
            None => Ok(()),
        },
    };

    shutdown.cancel();
    supervisor.drain().await;
    outcome
}

async fn poll_updates<S>(mut subscriber: Subscriber<S>, shutdown: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        select! {
            biased;
            _ = shutdown.cancelled() => break,
            polled = subscriber.poll_update(POLL_TIMEOUT) => {
                polled?;
            }
        }
    }

    let stats = subscriber.replica().stats();
    info!(
        discarded = stats.discarded,
        gaps = stats.gaps,
        "shutdown after handling {} updates",
        subscriber.replica().last_applied()
    );
    Ok(())
}

async fn generate_updates<S>(
    mut collector: CollectorClient<S>,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        select! {
            biased;
            _ = shutdown.cancelled() => return collector.close().await,
            _ = ticker.tick() => {
                let (key, body) = random_update();
                debug!(key = %key, "generating update");
                collector.push(key, body).await?;
            }
        }
    }
}

fn random_update() -> (String, String) {
    let mut rng = rand::thread_rng();
    (
        rng.gen_range(0..10_000).to_string(),
        rng.gen_range(0..1_000_000).to_string(),
    )
}

/// Sends one update through the collector and exits.
pub async fn push(args: PushArgs) -> Result<()> {
    let addr = resolve(&args.host, args.collector_port).await?;
    let mut collector = CollectorClient::connect(addr).await?;
    collector.push(args.key.clone(), args.value).await?;
    collector.close().await?;
    info!("pushed update for key={}", args.key);
    Ok(())
}
