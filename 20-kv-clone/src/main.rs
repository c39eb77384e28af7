use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use kv_clone::{
    client,
    config::{Cli, Command},
    server::Publisher,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Pub(args) => {
            let addrs = args.endpoints().resolve().await?;
            let publisher = Publisher::bind(&addrs).await?;
            if let Err(err) = publisher.run_until_ctrl_c().await {
                warn!("publisher exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Sub(args) => client::run(args).await?,
        Command::Push(args) => client::push(args).await?,
    }

    Ok(())
}
