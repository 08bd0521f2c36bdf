//! Command handlers.

use crate::config::CliConfig;
use crate::loader::Definitions;
use crate::log::JsonReleaseLog;
use crate::submit::ProcessSubmitter;
use anyhow::Result;
use cadence_core::Status;
use cadence_scheduler::{PipelineExecutor, ReleaseScheduler, WorkflowController, fan_out};
use chrono::{DateTime, Utc};
use console::style;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Validate a definitions file.
pub fn validate(path: &Path) -> Result<ExitCode> {
    let defs = Definitions::load(path)?;

    for pipeline in defs.pipelines() {
        println!(
            "{} Pipeline \"{}\" is valid",
            style("✓").green(),
            pipeline.name()
        );
        println!(
            "  Jobs: {}  Schedules: {}",
            pipeline.jobs().len(),
            pipeline.on().len()
        );
        for job in pipeline.jobs() {
            if job.needs.is_empty() {
                println!("    - {} ({} stages)", job.id, job.stages.len());
            } else {
                println!(
                    "    - {} ({} stages, needs {})",
                    job.id,
                    job.stages.len(),
                    job.needs.join(", ")
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Execute one pipeline and print its result.
pub async fn run_pipeline(
    config: &CliConfig,
    path: &Path,
    name: &str,
    params: Vec<(String, Value)>,
) -> Result<ExitCode> {
    let defs = Definitions::load(path)?;
    let pipeline = defs.pipeline(name)?;
    let executor = PipelineExecutor::new((*pipeline).clone(), &config.engine)?;

    let input: Map<String, Value> = params.into_iter().collect();
    let ctx = executor.parameterize(&input)?;

    eprintln!("{} Running {}", style("▶").cyan(), style(name).bold());
    let result = executor.execute(ctx, None).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result.status {
        Status::Success => {
            eprintln!("{} Pipeline {} succeeded", style("✓").green(), name);
            Ok(ExitCode::SUCCESS)
        }
        status => {
            eprintln!(
                "{} Pipeline {} finished with {:?}: {}",
                style("✗").red(),
                name,
                status,
                result.error_message().unwrap_or("no message")
            );
            Ok(ExitCode::from(result.status.code()))
        }
    }
}

/// Fan scheduled pipelines out across worker processes.
pub async fn schedule(
    config: &CliConfig,
    config_path: Option<PathBuf>,
    path: &Path,
    stop: Option<DateTime<Utc>>,
) -> Result<ExitCode> {
    let defs = Definitions::load(path)?;
    let names = defs.scheduled_names()?;
    if names.is_empty() {
        println!("{} No pipeline has a schedule", style("i").blue());
        return Ok(ExitCode::SUCCESS);
    }

    let controller = &config.engine.controller;
    let stop = match stop {
        Some(stop) => stop,
        None => Utc::now() + chrono::Duration::from_std(controller.stop_after)?,
    };
    let submitter = Arc::new(ProcessSubmitter::current(path)?.with_config(config_path));

    info!(pipelines = names.len(), stop = %stop, "Scheduling pipelines");
    let scheduled = fan_out(
        names,
        controller.chunk_size,
        controller.max_processes,
        stop,
        submitter,
    )
    .await?;

    println!(
        "{} Scheduled {} pipeline(s): {}",
        style("✓").green(),
        scheduled.len(),
        scheduled.join(", ")
    );
    Ok(ExitCode::SUCCESS)
}

/// Run one controller for `names` and print the scheduled names as JSON.
pub async fn worker(
    config: &CliConfig,
    path: &Path,
    names: &[String],
    stop: DateTime<Utc>,
) -> Result<ExitCode> {
    let defs = Definitions::load(path)?;
    let targets = defs.targets(names)?;

    let log = Arc::new(JsonReleaseLog::new(&config.log_dir));
    let scheduler = Arc::new(ReleaseScheduler::new(config.engine.clone(), log));
    let controller = WorkflowController::new(targets, scheduler)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, draining releases");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    });

    let report = controller.run_until(Some(stop), shutdown_rx).await?;
    for halted in &report.halted {
        warn!(pair = %halted, "Schedule halted");
    }
    println!("{}", serde_json::to_string(&report.scheduled)?);
    Ok(ExitCode::SUCCESS)
}
