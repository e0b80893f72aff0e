//! payment_indexer
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌────────────────┐    ┌──────────┐
//! │  Config  │───▶│ ChainWorkers │───▶│ BlockPipeline  │───▶│  Store   │
//! │  (YAML)  │    │ (per chain)  │    │ (commit/block) │    │ (PG/mem) │
//! └──────────┘    └──────────────┘    └────────────────┘    └──────────┘
//!                                              │
//!                                              ▼
//!                                     EventBus ──► log / webhook
//! ```
//!
//! Usage: `payment_indexer [--env <name>]` loads `config/<name>.yaml`.
//! Ctrl-C stops every chain between blocks; SIGHUP reloads the target catalog.

use anyhow::{Context, Result};
use payment_indexer::config::AppConfig;
use payment_indexer::engine::Engine;
use payment_indexer::logging::init_logging;
use payment_indexer::worker::WorkerExit;
use std::time::Duration;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[cfg(unix)]
async fn reload_signal(hangup: &mut tokio::signal::unix::Signal) {
    hangup.recv().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config/{env}.yaml"))?;
    let _log_guard = init_logging(&config);

    tracing::info!(
        env,
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        chains = config.chains.len(),
        "Starting payment indexer"
    );

    let engine = Engine::build(config).await.context("building engine")?;
    let workers = engine.spawn_workers().context("starting workers")?;
    tracing::info!(workers, "Chain workers running");

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    let mut status_tick = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_tick.tick().await;

    loop {
        #[cfg(unix)]
        let reload = reload_signal(&mut hangup);
        #[cfg(not(unix))]
        let reload = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                tracing::info!("Shutdown requested");
                break;
            }
            _ = reload => {
                if let Err(e) = engine.reload_targets() {
                    tracing::error!(error = %e, "Target reload failed, keeping previous catalog");
                }
            }
            _ = status_tick.tick() => {
                match engine.status().await {
                    Ok(status) => {
                        for chain in status.chains {
                            tracing::info!(
                                chain = %chain.chain,
                                name = %chain.name,
                                head = ?chain.head,
                                watermark = ?chain.watermark.map(|w| w.height),
                                phase = ?chain.phase,
                                providers = chain.providers.len(),
                                "Chain status"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Status snapshot failed"),
                }
            }
        }
    }

    let exits = engine.shutdown().await;
    let halted: Vec<_> = exits
        .iter()
        .filter_map(|(chain, exit)| match exit {
            WorkerExit::Halted(reason) => Some(format!("{chain}: {reason}")),
            WorkerExit::Shutdown => None,
        })
        .collect();
    if !halted.is_empty() {
        tracing::error!(chains = ?halted, "Chains halted during run");
    }
    tracing::info!("Payment indexer stopped");
    Ok(())
}
