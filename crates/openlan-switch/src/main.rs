//! OpenLAN switch daemon.

use anyhow::Context;
use clap::Parser;
use openlan_switch::{Switch, SwitchConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// OpenLAN virtual switch
#[derive(Parser, Debug)]
#[command(name = "olsw")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "/etc/openlan/switch/switch.toml")]
    config: PathBuf,

    /// Override the tunnel listen address
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => {
            info!("olsw: exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{:#}", e), "olsw: exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = if args.config.exists() {
        SwitchConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "configuration file not found, using defaults");
        SwitchConfig::default()
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    let save_interval = config.save_interval();

    let switch = Switch::new(config).context("building switch")?;
    switch.load_state();
    let addr = switch.start().await.context("starting switch")?;
    info!(%addr, networks = switch.networks().list().len(), users = switch.users().len(), "olsw: running");

    let mut ticker = save_interval.map(tokio::time::interval);
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "olsw: signal handler failed");
                }
                info!("olsw: shutting down");
                break;
            }
            _ = next_tick(&mut ticker) => {
                match switch.save_state() {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "olsw: periodic save failed, retrying next interval");
                    }
                    Err(e) => error!(error = %e, "olsw: periodic save failed"),
                }
            }
        }
    }

    switch.stop().await;
    Ok(())
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
