//! gliderqc - quality control for glider telemetry.
//!
//! ## Commands
//!
//! - `run`: QC every pending dataset of one or more deployments, then archive
//! - `status`: list queued datasets and their QC state
//! - `check-config`: validate a QC configuration file
//! - `archive`: retry relocation of `qc-complete` datasets

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gliderqc_core::DatasetStatus;
use gliderqc_pipeline::{BatchReport, PipelineOptions, QcPipeline, QcPlan};
use gliderqc_state::{
    DataLevel, DataMode, DatasetStore, DeploymentLayout, FsArchiver, FsDatasetStore,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "gliderqc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quality control for glider telemetry datasets", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which deployments, and which of their datasets, a command works on.
#[derive(Args)]
struct Deployments {
    /// Deployment names (glider-YYYYmmddTHHMM)
    #[arg(required = true)]
    deployments: Vec<String>,

    /// Glider data root
    #[arg(long, env = "GLIDER_DATA_HOME")]
    data_root: PathBuf,

    /// Deployment dataset status (rt or delayed)
    #[arg(short, long, default_value = "rt")]
    mode: DataMode,

    /// Dataset level (sci or ngdac)
    #[arg(long, default_value = "sci")]
    level: DataLevel,
}

impl Deployments {
    fn layouts(&self) -> Result<Vec<DeploymentLayout>> {
        self.deployments
            .iter()
            .map(|name| {
                DeploymentLayout::new(&self.data_root, name, self.mode, self.level)
                    .with_context(|| format!("cannot resolve deployment {name}"))
            })
            .collect()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run QC over the queued datasets of each deployment
    Run {
        #[command(flatten)]
        target: Deployments,

        /// QC config to use instead of the deployment or default config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Datasets processed concurrently
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Reprocess datasets that failed QC in an earlier run
        #[arg(long)]
        retry_failed: bool,

        /// Print the batch report as JSON instead of a table
        #[arg(long)]
        json_report: bool,

        /// Also write the JSON batch report to this file
        #[arg(long)]
        report_file: Option<PathBuf>,
    },

    /// Show queued datasets and their QC state
    Status {
        #[command(flatten)]
        target: Deployments,
    },

    /// Validate a QC config file and print its digest
    CheckConfig { path: PathBuf },

    /// Retry archival of datasets that completed QC
    Archive {
        #[command(flatten)]
        target: Deployments,

        #[arg(long)]
        json_report: bool,
    },
}

#[derive(Serialize)]
struct DeploymentReport<'a> {
    deployment: &'a str,
    #[serde(flatten)]
    report: &'a BatchReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gliderqc_core::init_tracing(cli.json, level);

    let clean = match cli.command {
        Commands::Run {
            target,
            config,
            workers,
            retry_failed,
            json_report,
            report_file,
        } => {
            let options = PipelineOptions {
                max_workers: workers,
                retry_failed,
            };
            cmd_run(
                &target,
                config.as_deref(),
                options,
                json_report,
                report_file.as_deref(),
            )
            .await?
        }
        Commands::Status { target } => cmd_status(&target)?,
        Commands::CheckConfig { path } => cmd_check_config(&path)?,
        Commands::Archive {
            target,
            json_report,
        } => cmd_archive(&target, json_report).await?,
    };

    if !clean {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve every deployment and its QC config before any dataset is touched.
fn resolve_deployments(
    target: &Deployments,
    config: Option<&Path>,
) -> Result<Vec<(DeploymentLayout, QcPlan)>> {
    let mut resolved = Vec::with_capacity(target.deployments.len());
    for layout in target.layouts()? {
        let name = layout.name();
        let path = match config {
            Some(path) => path.to_path_buf(),
            None => layout.resolve_config().with_context(|| {
                format!(
                    "no QC config for {name}: looked for {} and {}",
                    layout.deployment_config().display(),
                    layout.default_config().display()
                )
            })?,
        };
        let plan = QcPlan::load(&path)?;
        resolved.push((layout, plan));
    }
    Ok(resolved)
}

fn open_queue(layout: &DeploymentLayout) -> Result<(Arc<FsDatasetStore>, Arc<FsArchiver>)> {
    let queue = layout.queue_dir();
    if !queue.is_dir() {
        bail!("deployment {} has no queue directory at {}", layout.name(), queue.display());
    }
    let store = FsDatasetStore::new(&queue)
        .with_context(|| format!("Failed to open queue {}", queue.display()))?;
    let archiver = FsArchiver::new(queue, layout.data_dir());
    Ok((Arc::new(store), Arc::new(archiver)))
}

/// Flip the shutdown flag on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight profiles");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn cmd_run(
    target: &Deployments,
    config: Option<&Path>,
    options: PipelineOptions,
    json_report: bool,
    report_file: Option<&Path>,
) -> Result<bool> {
    let resolved = resolve_deployments(target, config)?;
    let shutdown = shutdown_on_ctrl_c();

    let mut reports = Vec::with_capacity(resolved.len());
    for (layout, plan) in resolved {
        if *shutdown.borrow() {
            break;
        }
        let (store, archiver) = open_queue(&layout)?;
        info!(deployment = %layout.name(), queue = %store.dir().display(), "starting QC batch");
        let pipeline = QcPipeline::new(store, archiver, plan, options.clone());
        let report = pipeline
            .run(shutdown.clone())
            .await
            .with_context(|| format!("QC batch for {} failed", layout.name()))?;
        let aborted = report.aborted;
        reports.push((layout.name().to_string(), report));
        if aborted {
            warn!(deployment = %layout.name(), "configuration error, remaining deployments skipped");
            break;
        }
    }

    print_reports(&reports, json_report)?;
    if let Some(path) = report_file {
        std::fs::write(path, reports_json(&reports)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "batch report written");
    }

    let complete = reports.len() == target.deployments.len();
    Ok(complete && reports.iter().all(|(_, report)| report.is_clean()))
}

async fn cmd_archive(target: &Deployments, json_report: bool) -> Result<bool> {
    let shutdown = shutdown_on_ctrl_c();
    let mut reports = Vec::with_capacity(target.deployments.len());
    for layout in target.layouts()? {
        let (store, archiver) = open_queue(&layout)?;
        let report = QcPipeline::archive_only(store, archiver)
            .run(shutdown.clone())
            .await?;
        reports.push((layout.name().to_string(), report));
    }
    print_reports(&reports, json_report)?;
    Ok(reports.iter().all(|(_, report)| report.is_clean()))
}

fn cmd_status(target: &Deployments) -> Result<bool> {
    for layout in target.layouts()? {
        let (store, _) = open_queue(&layout)?;
        let ids = store.list()?;

        println!("{} ({} queued)", layout.name(), ids.len());
        for id in ids {
            let state = store.state(&id)?;
            let note = match (state.status, state.last_error.as_deref()) {
                (_, Some(error)) => format!("  {error}"),
                (DatasetStatus::QcComplete, None) => "  archival pending".to_string(),
                _ => String::new(),
            };
            println!(
                "  {:<40} {:<16} attempts={}{}",
                id.as_str(),
                state.status.as_str(),
                state.attempts,
                note
            );
        }
    }
    Ok(true)
}

fn cmd_check_config(path: &Path) -> Result<bool> {
    let plan = QcPlan::load(path)?;
    println!("config:      {}", path.display());
    println!("digest:      {}", plan.digest());
    println!("qartod:      {} test(s)", plan.runner().tests().len());
    for configured in plan.runner().tests() {
        println!("  {:<16} {}", configured.name(), configured.variable);
    }
    match plan.hysteresis() {
        Some(test) => println!(
            "hysteresis:  {}",
            test.variables().collect::<Vec<_>>().join(", ")
        ),
        None => println!("hysteresis:  disabled"),
    }
    Ok(true)
}

fn reports_json(reports: &[(String, BatchReport)]) -> Result<String> {
    let wrapped: Vec<_> = reports
        .iter()
        .map(|(deployment, report)| DeploymentReport { deployment, report })
        .collect();
    Ok(serde_json::to_string_pretty(&wrapped)?)
}

fn print_reports(reports: &[(String, BatchReport)], json: bool) -> Result<()> {
    if json {
        println!("{}", reports_json(reports)?);
        return Ok(());
    }
    for (deployment, report) in reports {
        println!("{deployment}  run {}", report.run_id);
        if report.aborted {
            println!("  aborted: configuration error");
        }
        print!("{}", report.render_table());
        println!();
    }
    Ok(())
}
