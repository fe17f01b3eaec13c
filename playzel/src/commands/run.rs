//! Run command: execute one task definition

use playzel::{ConnectionStore, ExecutionContext, JsonFileChannel, Settings, TaskConfig, TaskError, TaskPipeline};
use std::path::Path;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Execute the task in `task_file`, stopping early on Ctrl-C or SIGTERM
pub async fn execute(
    settings: Settings,
    task_file: &Path,
    context_file: Option<&Path>,
    outputs_file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut task = TaskConfig::load(task_file)?;
    let context = match context_file {
        Some(path) => ExecutionContext::load(path)?,
        None => ExecutionContext::default(),
    };
    if task.task_id.is_empty() {
        task.task_id = if context.task_id.is_empty() {
            task_file
                .file_stem()
                .map_or_else(|| "task".to_string(), |s| s.to_string_lossy().into_owned())
        } else {
            context.task_id.clone()
        };
    }

    let connections = ConnectionStore::load(&settings.connections_file)?;
    let mut outputs = JsonFileChannel::open(outputs_file)?;
    let pipeline = TaskPipeline::new(settings);

    println!("▶ Running task {} ({})", task.task_id, task_file.display());

    // Dropping the execution future kills the engine and removes an ephemeral environment.
    let outcome = tokio::select! {
        outcome = pipeline.execute(&task, &context, &connections, &mut outputs) => outcome,
        signal = shutdown_signal() => {
            warn!("Received {}, stopping task {}", signal, task.task_id);
            Err(TaskError::Canceled)
        }
    };

    match outcome {
        Ok(report) => {
            info!("Task {} succeeded", task.task_id);
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("✓ Task {} succeeded", task.task_id);
            Ok(())
        }
        Err(e) => {
            if let Some(status) = e.run_status() {
                eprintln!("✗ Task {} ended with status {}", task.task_id, status);
            }
            Err(e.into())
        }
    }
}

/// Resolves with the name of the first of Ctrl-C or SIGTERM to arrive
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "Ctrl-C",
        () = terminate => "SIGTERM",
    }
}
