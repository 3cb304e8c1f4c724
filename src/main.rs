//! gridbot: automated limit-order trading engines for XTS-style brokers.
//!
//! Two engine variants behind one binary: `grid` (grid market-maker, with
//! optional secondary-ticker hedging via the config) and `pairs` (ratio
//! mean-reversion). Credentials come from the environment; strategy
//! parameters from per-engine JSON config files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gridbot::broker::XtsClient;
use gridbot::BrokerApi;
use gridbot::config::{BrokerCredentials, GridConfig, PairsConfig};
use gridbot::engine::grid::GridEngine;
use gridbot::engine::pairs::PairsEngine;

#[derive(Parser, Debug)]
#[command(name = "gridbot")]
#[command(about = "Grid market-making and pair mean-reversion engines")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the grid market-maker (hedged when the config has a hedge section)
    Grid {
        /// Path to the engine JSON config
        #[arg(long)]
        config: PathBuf,

        /// Print the computed ladder and exit without trading
        #[arg(long)]
        dry_run: bool,

        /// Cancel all tracked open orders and exit, leaving positions alone
        #[arg(long)]
        cancel_all: bool,
    },

    /// Run the pair ratio mean-reversion engine
    Pairs {
        /// Path to the engine JSON config
        #[arg(long)]
        config: PathBuf,

        /// Print the configured pairs and exit without trading
        #[arg(long)]
        dry_run: bool,

        /// Cancel all tracked open orders and exit, leaving positions alone
        #[arg(long)]
        cancel_all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    match args.command {
        Commands::Grid {
            config,
            dry_run,
            cancel_all,
        } => {
            let cfg = GridConfig::load(&config)?;
            if dry_run {
                if cfg.auto_anchor {
                    warn!("auto_anchor set; previewing ladder around the configured anchor");
                }
                cfg.print_ladder(cfg.anchor_price, cfg.base_spacing);
                return Ok(());
            }

            let creds = BrokerCredentials::from_env()?;
            let broker = Arc::new(XtsClient::new(creds, &cfg.exchange, &cfg.session_file));
            let symbols = trade_symbols(&cfg);
            let mut engine = GridEngine::new(cfg, broker.clone());

            if cancel_all {
                broker.connect(&symbols).await?;
                let cancelled = engine.cancel_all().await;
                broker.disconnect().await;
                info!("cancel-all done: {} orders cancelled", cancelled);
                return Ok(());
            }

            let shutdown = spawn_signal_handler();
            engine.start(shutdown).await?;
        }
        Commands::Pairs {
            config,
            dry_run,
            cancel_all,
        } => {
            let cfg = PairsConfig::load(&config)?;
            if dry_run {
                cfg.print_summary();
                return Ok(());
            }

            let creds = BrokerCredentials::from_env()?;
            let broker = Arc::new(XtsClient::new(creds, &cfg.exchange, &cfg.session_file));
            let symbols = cfg.all_symbols();
            let mut engine = PairsEngine::new(cfg, broker.clone());

            if cancel_all {
                broker.connect(&symbols).await?;
                let cancelled = engine.cancel_all().await;
                broker.disconnect().await;
                info!("cancel-all done: {} orders cancelled", cancelled);
                return Ok(());
            }

            let shutdown = spawn_signal_handler();
            engine.start(shutdown).await?;
        }
    }

    Ok(())
}

fn trade_symbols(cfg: &GridConfig) -> Vec<String> {
    let mut symbols = vec![cfg.symbol.clone()];
    if let Some(h) = &cfg.hedge {
        symbols.push(h.symbol.clone());
    }
    symbols
}

/// SIGINT/SIGTERM flip the shutdown flag; the engine finishes its current
/// iteration, saves state, and exits without cancelling orders.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTERM handler");
                    ctrl_c.await.ok();
                    let _ = tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("ctrl-c received");
        }
        let _ = tx.send(true);
    });
    rx
}
