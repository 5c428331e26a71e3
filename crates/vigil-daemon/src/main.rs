use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use vigil_core::VigilConfig;
use vigil_scheduler::{parse_go_duration, Schedule, Scheduler};

mod probe;

use probe::TcpProbe;

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Run recurring TCP reachability probes under bounded concurrency"
)]
struct Args {
    /// Config file. Defaults to ~/.vigil/vigil.toml.
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<String>,
    /// Stop after this long (Go duration, e.g. 90s) instead of waiting for Ctrl-C.
    #[arg(long, value_parser = parse_run_for)]
    run_for: Option<Duration>,
}

fn parse_run_for(s: &str) -> Result<Duration, String> {
    parse_go_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,vigil_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = VigilConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        VigilConfig::default()
    });

    let scheduler = Scheduler::from_config(&config.scheduler)
        .context("invalid scheduler configuration")?;

    // register monitors; a bad schedule skips that monitor only
    let mut handles = Vec::new();
    for monitor in &config.monitors {
        let schedule = match Schedule::parse(&monitor.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(monitor = %monitor.name, error = %e, "skipping monitor");
                continue;
            }
        };
        let probe = Arc::new(TcpProbe::from_config(monitor));
        let handle = scheduler.add(schedule, &monitor.name, &monitor.job_type, probe.task())?;
        handles.push(handle);
    }
    if handles.is_empty() {
        warn!("no monitors configured");
    }

    scheduler.start()?;
    info!(monitors = handles.len(), "vigil running");

    match args.run_for {
        Some(limit) => tokio::time::sleep(limit).await,
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?,
    }

    scheduler.stop().await?;
    let stats = serde_json::to_string(&scheduler.stats())?;
    info!(%stats, "vigil stopped");
    Ok(())
}
