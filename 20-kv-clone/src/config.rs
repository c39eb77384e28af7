use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::lookup_host;

pub const DEFAULT_SNAPSHOT_PORT: u16 = 3264;
pub const DEFAULT_PUBLISHER_PORT: u16 = 3265;
pub const DEFAULT_COLLECTOR_PORT: u16 = 3266;

/// Upper bound on a single wait for network input.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "publish and clone key/value state", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the state publisher.
    Pub(PubArgs),
    /// Clone the publisher's state and follow its updates.
    Sub(SubArgs),
    /// Send a single update through the collector and exit.
    Push(PushArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PortArgs {
    /// Port of the snapshot request channel. Use 0 for an ephemeral port.
    #[arg(short = 's', long, env = "KV_CLONE_SNAPSHOT_PORT", default_value_t = DEFAULT_SNAPSHOT_PORT)]
    pub snapshot_port: u16,

    /// Port of the live update channel.
    #[arg(short = 'p', long, env = "KV_CLONE_PUBLISHER_PORT", default_value_t = DEFAULT_PUBLISHER_PORT)]
    pub publisher_port: u16,

    /// Port of the collector channel that accepts updates from writers.
    #[arg(short = 'c', long, env = "KV_CLONE_COLLECTOR_PORT", default_value_t = DEFAULT_COLLECTOR_PORT)]
    pub collector_port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct PubArgs {
    /// Host to bind the three channels on.
    #[arg(short = 'H', long, env = "KV_CLONE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[command(flatten)]
    pub ports: PortArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SubArgs {
    /// Host the publisher runs on.
    #[arg(short = 'H', long, env = "KV_CLONE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[command(flatten)]
    pub ports: PortArgs,

    /// Push a random update through the collector on every interval.
    #[arg(long)]
    pub generate: bool,

    /// Milliseconds between generated updates.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    /// Host the publisher runs on.
    #[arg(short = 'H', long, env = "KV_CLONE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the collector channel.
    #[arg(short = 'c', long, env = "KV_CLONE_COLLECTOR_PORT", default_value_t = DEFAULT_COLLECTOR_PORT)]
    pub collector_port: u16,

    #[arg(long)]
    pub key: String,

    #[arg(long)]
    pub value: String,
}

/// Where the three channels live, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub host: String,
    pub snapshot_port: u16,
    pub publisher_port: u16,
    pub collector_port: u16,
}

impl Endpoints {
    pub fn new(host: impl Into<String>, ports: &PortArgs) -> Self {
        Self {
            host: host.into(),
            snapshot_port: ports.snapshot_port,
            publisher_port: ports.publisher_port,
            collector_port: ports.collector_port,
        }
    }

    pub async fn resolve(&self) -> Result<ChannelAddrs> {
        Ok(ChannelAddrs {
            snapshot: resolve(&self.host, self.snapshot_port).await?,
            publisher: resolve(&self.host, self.publisher_port).await?,
            collector: resolve(&self.host, self.collector_port).await?,
        })
    }
}

impl PubArgs {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(self.host.clone(), &self.ports)
    }
}

impl SubArgs {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(self.host.clone(), &self.ports)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Resolved socket addresses of the snapshot, live update and collector
/// channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddrs {
    pub snapshot: SocketAddr,
    pub publisher: SocketAddr,
    pub collector: SocketAddr,
}

impl ChannelAddrs {
    /// All three channels on one address, typically port 0 for tests.
    pub fn uniform(addr: SocketAddr) -> Self {
        Self {
            snapshot: addr,
            publisher: addr,
            collector: addr,
        }
    }
}

pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("{host}:{port} did not resolve to any address"))
}
