use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use wagerbook_engine::{spawn_payment_workers, Engine, LedgerStore, SqliteStore, SystemClock};
use wagerbook_node::{api, Config, ValidatedConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Wallet ledger and escrow node.", long_about = None)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long)]
    config: PathBuf,

    /// Validate the config and exit without starting the node.
    #[arg(long)]
    check: bool,
}

fn init_tracing(level: Level, json: bool) {
    let builder = tracing_subscriber::fmt().with_max_level(level);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read config file {}", path.display()))?;
    serde_yaml::from_str(&contents).context("Could not parse config file")
}

fn print_check_report(config: &ValidatedConfig) {
    println!("config check");
    println!("  port: {}", config.port);
    println!("  database: {}", config.database.display());
    println!(
        "  workers: {} queue_size={} max_attempts={}",
        config.workers, config.queue_size, config.max_attempts
    );
    println!(
        "  backoff: initial={:?} max={:?}",
        config.initial_backoff, config.max_backoff
    );
    println!("  sweep_interval: {:?}", config.sweep_interval);
    println!(
        "  engine: currency={} commit_timeout={:?} section_timeout={:?}",
        config.engine.currency, config.engine.commit_timeout, config.engine.section_timeout
    );
    println!(
        "  rate_limit: {} per {:?}",
        config.engine.rate_limit.max_operations, config.engine.rate_limit.window
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}

/// Periodically close bets whose deadlines have elapsed.
async fn run_sweeper<S: LedgerStore>(
    engine: Arc<Engine<S>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.expire_due().await {
                    warn!(%err, "deadline sweep failed");
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    if args.check {
        println!("{:#?}", config.redacted_debug());
        let config = config.validate().context("invalid config")?;
        print_check_report(&config);
        println!("config ok");
        return Ok(());
    }

    let redacted = format!("{:?}", config.redacted_debug());
    let config = config.validate().context("invalid config")?;
    init_tracing(config.log_level, config.log_json);
    info!(config = %redacted, "loaded config file");

    let store = SqliteStore::open(&config.database, config.engine.commit_timeout)
        .with_context(|| format!("failed to open ledger {}", config.database.display()))?;
    info!(path = %config.database.display(), "ledger opened");

    let worker_config = config.worker_config();
    let engine = Arc::new(
        Engine::new(
            Arc::new(store),
            config.engine,
            Arc::new(SystemClock),
            None,
        )
        .context("failed to start engine")?,
    );

    let (queue, workers) = spawn_payment_workers(engine.clone(), worker_config);
    info!(workers = workers.len(), "payment workers started");

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(engine.clone(), config.sweep_interval, stop_rx));

    let state = Arc::new(api::ApiState {
        engine,
        queue,
        webhook_token: config.webhook_token,
    });
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // The router owned the last queue sender; workers exit once the queue drains.
    let _ = stop_tx.send(true);
    if let Err(err) = sweeper.await {
        error!(?err, "sweeper task failed");
    }
    match tokio::time::timeout(config.shutdown_grace, join_all(workers)).await {
        Ok(results) => {
            for result in results {
                if let Err(err) = result {
                    error!(?err, "payment worker failed");
                }
            }
            info!("payment queue drained");
        }
        Err(_) => warn!(grace = ?config.shutdown_grace, "payment workers still busy at shutdown"),
    }
    Ok(())
}
