use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};

use device_harvester::logging::init_tracing;
use device_harvester::{HarvestConfig, HarvestOrchestrator, SourcePath, TokioSpawner};

/// Pulls new files from every attached device through a device-bridge tool
#[derive(Parser, Debug)]
#[clap(name = "device-harvester", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// JSON configuration file; flags below override its values
    #[clap(long)]
    config: Option<PathBuf>,

    /// Root directory for harvested content
    #[clap(long)]
    storage_root: Option<PathBuf>,

    /// Directory for temporary command output
    #[clap(long)]
    scratch_root: Option<PathBuf>,

    /// Bridge program to invoke (default: adb)
    #[clap(long)]
    bridge: Option<String>,

    /// Child count above which a library is pulled as one unit
    #[clap(long)]
    threshold: Option<usize>,

    /// Source path to harvest (documents, downloads, media); repeatable
    #[clap(long = "source")]
    sources: Vec<SourcePath>,

    /// Delete entries from the device after a successful pull
    #[clap(long)]
    remove_after_pull: bool,

    /// Write the JSON run report here instead of stdout
    #[clap(long)]
    report: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<HarvestConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => HarvestConfig::from_json_file(path)?,
        None => HarvestConfig::default(),
    };

    if let Some(root) = &args.storage_root {
        config = config.with_storage_root(root);
    }
    if let Some(root) = &args.scratch_root {
        config = config.with_scratch_root(root);
    }
    if let Some(program) = &args.bridge {
        config = config.with_bridge_program(program);
    }
    if let Some(threshold) = args.threshold {
        config = config.with_child_threshold(threshold);
    }
    if !args.sources.is_empty() {
        config = config.with_source_paths(args.sources.clone());
    }
    if args.remove_after_pull {
        config = config.with_remove_after_pull(true);
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let orchestrator = HarvestOrchestrator::new(config, TokioSpawner)?;

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current command");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await?;
    let json = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }

    Ok(!report.has_failures() && !report.cancelled)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("info");

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
