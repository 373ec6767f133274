//! Command-line client for capture orchestration

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use workshop_capture::{
    init_tracing, CaptureCoordinator, CaptureError, CaptureEvent, CaptureResult, CaptureStatus,
    CaptureTask, CoordinatorConfig, ErrorResponse, OfferSource, SessionDescriptor, StaticOffer,
    TaskId, WorkshopId,
};

#[derive(Debug, Parser)]
#[command(name = "capturectl", version, about = "Manage workshop capture tasks")]
struct Cli {
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List capture tasks
    List {
        #[arg(long)]
        workshop: Option<String>,
        /// Only tasks in this state (pending, running, completed, cancelled, failed)
        #[arg(long)]
        status: Option<CaptureStatus>,
    },
    /// Show one capture task
    Get { id: String },
    /// Cancel a capture task
    Cancel { id: String },
    /// Start a capture and negotiate its live preview
    Start {
        workshop: String,
        /// File containing the local SDP offer
        #[arg(long, env = "CAPTURE_OFFER_FILE")]
        offer_file: PathBuf,
    },
    /// Follow task changes for a workshop until interrupted
    Watch { workshop: String },
}

/// Offer source for commands that never negotiate
struct NoOffer;

#[async_trait]
impl OfferSource for NoOffer {
    async fn create_offer(&self, workshop_id: &WorkshopId) -> CaptureResult<SessionDescriptor> {
        Err(CaptureError::InvalidRequest(format!(
            "no local offer available for workshop {workshop_id}"
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CoordinatorConfig::from_env().context("loading CAPTURE_* configuration")?;

    let result = run(&cli, &config).await;
    if let Err(err) = &result {
        if cli.json {
            if let Some(capture_err) = err.downcast_ref::<CaptureError>() {
                let response = ErrorResponse {
                    code: capture_err.code().to_string(),
                    message: capture_err.to_string(),
                    retryable: capture_err.is_retryable(),
                };
                eprintln!("{}", serde_json::to_string_pretty(&response)?);
            }
        }
    }
    result
}

async fn run(cli: &Cli, config: &CoordinatorConfig) -> Result<()> {
    match &cli.command {
        Commands::List { workshop, status } => {
            let coordinator = CaptureCoordinator::from_config(config, Arc::new(NoOffer))?;
            let workshop = workshop.as_deref().map(WorkshopId::from);
            match &workshop {
                Some(workshop_id) => coordinator.sync_workshop(workshop_id).await?,
                None => coordinator.sync_all().await?,
            };
            let tasks = match status {
                Some(status) => coordinator.list_by_status(workshop.as_ref(), *status),
                None => coordinator.list(workshop.as_ref()),
            };
            print_tasks(&tasks, cli.json)?;
        }
        Commands::Get { id } => {
            let coordinator = CaptureCoordinator::from_config(config, Arc::new(NoOffer))?;
            let task = coordinator.refresh_task(&TaskId::new(id.as_str())).await?;
            print_tasks(std::slice::from_ref(&task), cli.json)?;
        }
        Commands::Cancel { id } => {
            let coordinator = CaptureCoordinator::from_config(config, Arc::new(NoOffer))?;
            let task_id = TaskId::new(id.as_str());
            coordinator.refresh_task(&task_id).await?;
            coordinator.cancel_capture(&task_id).await?;
            let task = coordinator.get(&task_id)?;
            print_tasks(std::slice::from_ref(&task), cli.json)?;
        }
        Commands::Start {
            workshop,
            offer_file,
        } => {
            let offers = StaticOffer::from_file(offer_file).await?;
            let coordinator = CaptureCoordinator::from_config(config, Arc::new(offers))?;
            let task = coordinator
                .start_capture(&WorkshopId::from(workshop.as_str()))
                .await?;
            let preview = coordinator.preview(&task.id);
            if cli.json {
                print_json(&serde_json::json!({ "task": task, "preview": preview }))?;
            } else {
                print_tasks(std::slice::from_ref(&task), false)?;
                if let Some(preview) = preview {
                    println!("{}", preview.answer.as_str());
                }
            }
        }
        Commands::Watch { workshop } => {
            let coordinator = CaptureCoordinator::from_config(config, Arc::new(NoOffer))?;
            let workshop_id = WorkshopId::from(workshop.as_str());
            let mut events = coordinator.subscribe();
            coordinator.sync_workshop(&workshop_id).await?;
            print_tasks(&coordinator.list(Some(&workshop_id)), cli.json)?;
            coordinator.start_polling();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(CaptureEvent::StatusChanged { task_id, workshop_id: w, from, to })
                            if w == workshop_id =>
                        {
                            println!("{task_id}: {from} -> {to}");
                        }
                        Ok(CaptureEvent::Created(task)) if task.workshop_id == workshop_id => {
                            println!("{}: {} (new)", task.id, task.status);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            coordinator.shutdown();
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tasks(tasks: &[CaptureTask], json: bool) -> Result<()> {
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No capture tasks.");
        return Ok(());
    }
    for task in tasks {
        let error = task
            .error_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| format!("  ({m})"))
            .unwrap_or_default();
        println!(
            "[{}] workshop {}  {}  created {}{}",
            task.id,
            task.workshop_id,
            task.status,
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            error
        );
    }
    Ok(())
}
