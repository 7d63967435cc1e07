//! ipwatchd: threat-indicator collection daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ipwatch_core::{IpwatchConfig, Registry, SystemClock};
use ipwatch_runtime::bootstrap::{self, INDICATORS, ORCHESTRATOR};
use ipwatch_runtime::scheduler::{self, Scheduler};
use ipwatch_runtime::{CollectionOrchestrator, IndicatorService, TriggerParams};

fn resolve_data_dir() -> PathBuf {
    std::env::var("IPWATCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn build(data_dir: &Path) -> anyhow::Result<(IpwatchConfig, Registry)> {
    let config = IpwatchConfig::from_env(data_dir)?;
    let registry = bootstrap::build_registry(config.clone(), Arc::new(SystemClock))?;
    Ok((config, registry))
}

fn print_help() {
    println!("ipwatchd: threat-indicator collection daemon");
    println!();
    println!("Usage: ipwatchd [command]");
    println!();
    println!("Commands:");
    println!("  (none)              Run the scheduler until interrupted");
    println!("  status              Print per-source collection status");
    println!("  collect <source>    Run one manual collection and print the run");
    println!("  sweep               Remove records past their grace window");
    println!("  help                Show this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let data_dir = resolve_data_dir();

    if args.len() > 1 {
        match args[1].as_str() {
            "status" => {
                let (_, registry) = build(&data_dir)?;
                let orchestrator: Arc<CollectionOrchestrator> = registry.resolve(ORCHESTRATOR)?;
                let status = orchestrator.get_status()?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            "collect" => {
                let Some(source) = args.get(2) else {
                    eprintln!("Usage: ipwatchd collect <source>");
                    std::process::exit(1);
                };
                let (_, registry) = build(&data_dir)?;
                let orchestrator: Arc<CollectionOrchestrator> = registry.resolve(ORCHESTRATOR)?;
                let run = orchestrator
                    .trigger_and_wait(source, TriggerParams::manual())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&run)?);
                return Ok(());
            }
            "sweep" => {
                let (_, registry) = build(&data_dir)?;
                let service: Arc<IndicatorService> = registry.resolve(INDICATORS)?;
                let removed = scheduler::sweep_once(&service).await;
                println!("Removed {} records", removed);
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'ipwatchd help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    info!("Data directory: {}", data_dir.display());
    let (config, registry) = build(&data_dir)?;
    let orchestrator: Arc<CollectionOrchestrator> = registry.resolve(ORCHESTRATOR)?;
    let service: Arc<IndicatorService> = registry.resolve(INDICATORS)?;

    let interrupted = orchestrator.recover_interrupted()?;
    if interrupted > 0 {
        warn!("Marked {} runs from a previous process as interrupted", interrupted);
    }

    for source in &config.sources {
        if source.enabled && (source.username.is_empty() || source.password.is_empty()) {
            warn!("Source {} is enabled without credentials", source.name);
        }
    }
    info!(
        "Services ready: {} registered, {} sources",
        registry.get_service_info().registered,
        config.sources.len()
    );

    let scheduler = Scheduler::start(
        orchestrator,
        service,
        scheduler::DEFAULT_TICK,
        config.retention.sweep_interval,
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    scheduler.shutdown();

    Ok(())
}
