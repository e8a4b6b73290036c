use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tokio::{io::BufReader, net::TcpListener};
use tracing::{info, warn};

use relay_chat::{
    bot,
    cli::{Cli, Command, normalize_args},
    client,
    pool::WorkerPool,
    server::Server,
};

/// The client runs two engine loops plus one command at a time.
const MIN_WORKERS: usize = 3;

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

    let cli = Cli::parse_from(normalize_args(std::env::args()));
    if cli.workers < MIN_WORKERS {
        warn!(
            requested = cli.workers,
            "worker pool too small, using {MIN_WORKERS}"
        );
    }
    let pool = WorkerPool::new(cli.workers.max(MIN_WORKERS));

    match cli.command {
        Command::Server(args) => {
            let listener = TcpListener::bind((args.address.as_str(), args.port)).await?;
            let server = Server::new(listener, pool);
            let addr = server.local_addr()?;
            info!("server listening on {}", addr);
            let console = BufReader::new(tokio::io::stdin());
            if let Err(err) = server.run_with_console(console, ctrl_c()).await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args, pool).await?,
        Command::Bot(args) => bot::run(args, pool).await?,
    }

    Ok(())
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}
