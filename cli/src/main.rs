//! chainsync CLI: run chain sync workers from the terminal.
//!
//! Usage:
//! ```bash
//! # Connect to every enabled network and follow new blocks until Ctrl-C
//! chainsync run --config chainsync.yaml
//!
//! # Validate a config file and list its networks
//! chainsync check --config chainsync.yaml
//! ```

mod telemetry;
mod watcher;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use chainsync_core::{Broker, ChainSyncConfig, Metrics};
use chainsync_worker::{MemoryEventStore, WorkerDeps, WorkerManager, WorkerSettings};
use chainsync_ws::{WsClientConfig, WsConnector};

use crate::watcher::LogWatchers;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "check" => cmd_check(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsync {}", env!("CARGO_PKG_VERSION"));
    println!("Keep a local read model in sync with EVM chains over WebSocket\n");
    println!("USAGE:");
    println!("    chainsync <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run        Start a worker per enabled network until Ctrl-C");
    println!("    check      Validate a config file and list its networks");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --config <FILE>   YAML or JSON config file  [required]\n");
    println!("ENVIRONMENT:");
    println!("    CHAINSYNC_RPC_URL_<CHAIN_ID>   Override a network's RPC URL");
    println!("    CHAINSYNC_LOG                  Override log.level");
    println!("    RUST_LOG                       Override all log directives");
}

fn load_config(args: &[String]) -> anyhow::Result<(String, ChainSyncConfig)> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let config =
        ChainSyncConfig::load(&path).with_context(|| format!("failed to load config {path}"))?;
    Ok((path, config))
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let (path, config) = load_config(args)?;
    telemetry::init_tracing(&config.log);
    info!(config = %path, networks = config.networks.len(), "chainsync starting");

    let metrics = Arc::new(Metrics::new());
    let broker = Broker::new(config.broker_channel_capacity, Arc::clone(&metrics));
    let deps = WorkerDeps {
        connector: Arc::new(WsConnector::new(
            WsClientConfig::from(&config),
            Arc::clone(&metrics),
        )),
        watchers: Arc::new(LogWatchers),
        store: Arc::new(MemoryEventStore::new()),
        metrics: Arc::clone(&metrics),
        broker: broker.clone(),
        settings: WorkerSettings::from(&config),
    };
    let manager = WorkerManager::new(&config, deps);
    let mut health = broker.subscribe_health();

    manager.start().await;

    let mut health_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            snapshot = health.recv(), if health_open => match snapshot {
                Some(_) => {
                    for chain in manager.status() {
                        info!(
                            chain_id = chain.chain_id,
                            provider = %chain.provider_status,
                            worker = %chain.worker_status,
                            restarts = chain.restart_count,
                            last_block = ?chain.last_known_block,
                            "chain health"
                        );
                    }
                }
                None => health_open = false,
            },
        }
    }

    info!("shutting down");
    health.cancel();
    manager.destroy().await;
    print!("{}", metrics.dump_metrics());
    Ok(())
}

fn cmd_check(args: &[String]) -> anyhow::Result<()> {
    let (path, config) = load_config(args)?;

    println!("Config OK: {path}\n");
    println!("  {:<10} {:<8} {:<44} RPC URL", "CHAIN", "ENABLED", "DIRECTORY");
    for network in &config.networks {
        println!(
            "  {:<10} {:<8} {:<44} {}",
            network.chain_id, network.enabled, network.directory_address, network.rpc_url
        );
    }
    println!();
    println!("  Restart delay:   {}ms", config.worker_restart_delay_ms);
    println!("  Ping / pong:     {}ms / {}ms", config.rpc_ping_delay_ms, config.rpc_pong_max_wait_ms);
    println!(
        "  Retries:         {} every {}ms",
        config.rpc_max_retry_count, config.rpc_retry_delay_ms
    );
    println!("  Connect timeout: {}ms", config.rpc_connect_timeout_ms);
    println!("  Backfill batch:  {} blocks", config.backfill_batch_size);
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
