use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, select, task::JoinHandle, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{self, UpdateBus},
    collector,
    config::ChannelAddrs,
    snapshot,
    state::{PublisherHandle, StateOwner},
    supervisor::{Supervisor, TaskExit},
    transport::Connection,
};

/// Failures a single role may accumulate before the publisher gives up.
pub const MAX_RELAUNCHES: u32 = 5;

const RELAUNCH_DELAY: Duration = Duration::from_millis(100);

/// How long shutdown waits for connection handlers before abandoning them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherRole {
    SnapshotResponder,
    UpdateBroadcaster,
    CollectorIngester,
}

impl PublisherRole {
    pub const ALL: [PublisherRole; 3] = [
        PublisherRole::SnapshotResponder,
        PublisherRole::UpdateBroadcaster,
        PublisherRole::CollectorIngester,
    ];
}

impl fmt::Display for PublisherRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublisherRole::SnapshotResponder => "snapshot responder",
            PublisherRole::UpdateBroadcaster => "update broadcaster",
            PublisherRole::CollectorIngester => "collector ingester",
        })
    }
}

/// The authoritative side: owns the state and serves the snapshot, live
/// update and collector channels.
pub struct Publisher {
    listeners: Listeners,
    bus: UpdateBus,
    handle: PublisherHandle,
    owner: JoinHandle<u64>,
    owner_shutdown: CancellationToken,
}

#[derive(Clone)]
struct Listeners {
    snapshot: Arc<TcpListener>,
    publisher: Arc<TcpListener>,
    collector: Arc<TcpListener>,
}

impl Publisher {
    /// Binds all three channels and starts the state owner. Fails if any
    /// channel cannot be bound.
    pub async fn bind(addrs: &ChannelAddrs) -> Result<Self> {
        let snapshot = bind_channel("snapshot", addrs.snapshot).await?;
        let publisher = bind_channel("publisher", addrs.publisher).await?;
        let collector = bind_channel("collector", addrs.collector).await?;

        let bus = UpdateBus::default();
        let (owner, handle) = StateOwner::new(bus.clone());
        let owner_shutdown = CancellationToken::new();
        let owner = tokio::spawn(owner.run(owner_shutdown.clone()));

        Ok(Self {
            listeners: Listeners {
                snapshot: Arc::new(snapshot),
                publisher: Arc::new(publisher),
                collector: Arc::new(collector),
            },
            bus,
            handle,
            owner,
            owner_shutdown,
        })
    }

    pub fn local_addrs(&self) -> std::io::Result<ChannelAddrs> {
        Ok(ChannelAddrs {
            snapshot: self.listeners.snapshot.local_addr()?,
            publisher: self.listeners.publisher.local_addr()?,
            collector: self.listeners.collector.local_addr()?,
        })
    }

    /// In-process writer and inspector for the authoritative state.
    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    /// Serves until `shutdown` resolves or a role fails too often.
    ///
    /// Connection handlers are told to stop and awaited before the state
    /// owner is shut down, so no handler is cut off mid-message.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Publisher {
            listeners,
            bus,
            handle,
            owner,
            owner_shutdown,
        } = self;
        tokio::pin!(shutdown);

        let roles = Roles {
            listeners,
            bus,
            handle,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            next_peer: Arc::new(AtomicU64::new(1)),
        };
        let mut supervisor = Supervisor::new();
        for role in PublisherRole::ALL {
            roles.launch(role, &mut supervisor, Duration::ZERO);
        }

        let mut failures = HashMap::new();
        let outcome = loop {
            select! {
                _ = &mut shutdown => {
                    info!("publisher shutting down");
                    break Ok(());
                }
                exit = supervisor.next_exit() => {
                    let Some(exit) = exit else { break Ok(()) };
                    let role = exit.role;
                    if let Err(err) = relaunch_policy(exit, &mut failures) {
                        break Err(err);
                    }
                    roles.launch(role, &mut supervisor, RELAUNCH_DELAY);
                }
            }
        };

        roles.shutdown.cancel();
        supervisor.drain().await;
        roles.connections.close();
        if timeout(DRAIN_TIMEOUT, roles.connections.wait()).await.is_err() {
            warn!(
                open = roles.connections.len(),
                "connections still open after shutdown; abandoning them"
            );
        }

        owner_shutdown.cancel();
        let handled = owner.await.context("state owner task failed")?;
        info!("shutdown after handling {handled} updates");

        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn bind_channel(name: &str, addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} socket to {addr}"))?;
    info!("bound {} socket to {}", name, listener.local_addr()?);
    Ok(listener)
}

/// Decides whether a finished role may be relaunched.
fn relaunch_policy(
    exit: TaskExit<PublisherRole>,
    failures: &mut HashMap<PublisherRole, u32>,
) -> Result<()> {
    let TaskExit { role, result } = exit;
    match result {
        Ok(()) => {
            warn!(%role, "role stopped unexpectedly; relaunching");
            Ok(())
        }
        Err(err) => {
            let count = failures.entry(role).or_insert(0);
            *count += 1;
            if *count > MAX_RELAUNCHES {
                error!(%role, error = ?err, "role keeps failing; shutting down");
                return Err(err.context(format!("{role} failed {count} times")));
            }
            warn!(%role, attempt = *count, error = ?err, "role failed; relaunching");
            Ok(())
        }
    }
}

struct Roles {
    listeners: Listeners,
    bus: UpdateBus,
    handle: PublisherHandle,
    shutdown: CancellationToken,
    connections: TaskTracker,
    next_peer: Arc<AtomicU64>,
}

impl Roles {
    fn launch(&self, role: PublisherRole, supervisor: &mut Supervisor<PublisherRole>, delay: Duration) {
        let acceptor = Acceptor {
            role,
            shutdown: self.shutdown.clone(),
            connections: self.connections.clone(),
            next_peer: Arc::clone(&self.next_peer),
        };
        let token = self.shutdown.clone();

        match role {
            PublisherRole::SnapshotResponder => {
                let listener = Arc::clone(&self.listeners.snapshot);
                let state = self.handle.clone();
                supervisor.launch(role, async move {
                    tokio::time::sleep(delay).await;
                    acceptor
                        .run(listener, move |mut conn, peer| {
                            let state = state.clone();
                            let token = token.clone();
                            async move {
                                snapshot::serve_snapshots(&mut conn, &state, peer, &token).await
                            }
                        })
                        .await
                });
            }
            PublisherRole::UpdateBroadcaster => {
                let listener = Arc::clone(&self.listeners.publisher);
                let bus = self.bus.clone();
                supervisor.launch(role, async move {
                    tokio::time::sleep(delay).await;
                    acceptor
                        .run(listener, move |mut conn, _peer| {
                            // Subscribe at accept time, before the greeting goes out.
                            let updates = bus.subscribe();
                            let token = token.clone();
                            async move { bus::serve_subscriber(&mut conn, updates, &token).await }
                        })
                        .await
                });
            }
            PublisherRole::CollectorIngester => {
                let listener = Arc::clone(&self.listeners.collector);
                let state = self.handle.clone();
                supervisor.launch(role, async move {
                    tokio::time::sleep(delay).await;
                    acceptor
                        .run(listener, move |mut conn, peer| {
                            let state = state.clone();
                            let token = token.clone();
                            async move {
                                let accepted = collector::ingest(&mut conn, &state, &token).await?;
                                debug!(peer, accepted, "writer disconnected");
                                Ok(())
                            }
                        })
                        .await
                });
            }
        }
    }
}

/// Accept loop shared by the three channels. Each connection gets its own
/// tracked task; a failing connection is logged and dropped.
struct Acceptor {
    role: PublisherRole,
    shutdown: CancellationToken,
    connections: TaskTracker,
    next_peer: Arc<AtomicU64>,
}

impl Acceptor {
    async fn run<H, Fut>(self, listener: Arc<TcpListener>, handler: H) -> Result<()>
    where
        H: Fn(Connection, u64) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let role = self.role;
        loop {
            let (stream, addr) = select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    accepted.with_context(|| format!("{role} failed to accept a connection"))?
                }
            };

            if let Err(err) = stream.set_nodelay(true) {
                debug!(%role, error = ?err, "failed to disable nagle");
            }
            let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
            debug!(%role, peer, %addr, "accepted connection");

            let session = handler(Connection::new(stream), peer);
            self.connections.spawn(async move {
                match session.await {
                    Ok(()) => debug!(%role, peer, "connection closed"),
                    Err(err) => warn!(%role, peer, %addr, error = ?err, "connection closed with error"),
                }
            });
        }
    }
}
