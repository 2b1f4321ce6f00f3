//! strata-server binary.
//!
//! Hosts the mount core: performs the bootstrap mounts listed in the config
//! file, then serves the control channel as JSON lines on stdin/stdout.
//!
//! Usage:
//!   strata-server --config strata.toml
//!   echo '{"cmd":"paths"}' | strata-server
//!
//! Commands, one per line:
//!   {"cmd":"mount","requests":[{"paths":["/c1"],"storage_params":{"type":"memory"}}]}
//!   {"cmd":"unmount","ident":1}
//!   {"cmd":"paths"} {"cmd":"mounts"} {"cmd":"inodes"} {"cmd":"children","ident":1}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use strata_kernel::control::parse_command;
use strata_kernel::{
    BackendRegistry, ControlResponse, MountController, MountOutcome, MountTable, Router,
    StrataConfig, spawn_control_channel,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Virtual filesystem mount host.
#[derive(Parser, Debug)]
#[command(name = "strata-server")]
#[command(about = "Mount host with a JSON-lines control channel on stdio")]
struct Args {
    /// Bootstrap configuration (absent file means no bootstrap mounts)
    #[arg(short, long, default_value = "strata.toml")]
    config: PathBuf,

    /// Log filter, overriding the config file (RUST_LOG still wins)
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Config comes first: it may carry the log filter.
    let config = match StrataConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let fallback = args
        .log_filter
        .or_else(|| config.log_filter.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // stdout carries the control protocol, so logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("strata-server failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: StrataConfig) -> Result<()> {
    let table = Arc::new(MountTable::new());
    let router = Arc::new(Router::new(table.clone()));
    let controller = Arc::new(MountController::new(BackendRegistry::with_builtin(), router));

    // Backend mount() calls may block.
    let results = {
        let controller = controller.clone();
        let mounts = config.mounts;
        tokio::task::spawn_blocking(move || controller.mount_all(&mounts))
            .await
            .context("bootstrap mounts")?
    };
    let failed = results
        .iter()
        .filter(|r| matches!(r, MountOutcome::Error(_)))
        .count();
    info!(
        mounted = results.len() - failed,
        failed, "bootstrap mounts complete"
    );

    let (handle, task) = spawn_control_channel(controller, config.control_capacity);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("reading control input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match parse_command(line) {
            Ok(command) => handle.send(command).await?,
            Err(report) => {
                warn!(kind = %report.kind, "rejected control line");
                ControlResponse::Error(report)
            }
        };
        let mut out = serde_json::to_vec(&response).context("encoding response")?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("control input closed, shutting down");
    drop(handle);
    task.await.context("control task")?;

    let failures = tokio::task::spawn_blocking(move || table.unmount_all())
        .await
        .context("unmount at shutdown")?;
    for (ident, e) in failures {
        warn!(%ident, error = %e, "unmount at shutdown failed");
    }
    Ok(())
}
