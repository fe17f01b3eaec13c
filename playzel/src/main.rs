//! Playzel - playbook task runner with cached execution environments
//!
//! Orchestrates:
//! 1. Task definition and execution context loading
//! 2. Deferred value resolution (using convenient-ansible)
//! 3. Environment fingerprinting and provisioning (using convenient-venv)
//! 4. Playbook execution with event capture (using convenient-ansible)
//! 5. Result reporting to the task's output channel

mod commands;

use clap::Parser;
use commands::{CacheOperation, Cli, Commands};
use playzel::Settings;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playzel=info,convenient_venv=info,convenient_ansible=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Returning lets the runtime wait for an in-flight environment build,
    // whose ephemeral directory is removed once it completes.
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(cli.config.as_deref())?.with_cache_key(cli.cache_key);

    match cli.command {
        Commands::Run { task, context, outputs } => {
            commands::run::execute(settings, &task, context.as_deref(), &outputs).await
        }
        Commands::Fingerprint { task } => commands::fingerprint::execute(&settings, &task),
        Commands::Cache { cache_root, operation } => match operation {
            CacheOperation::Info => commands::cache::info(&cache_root),
            CacheOperation::Evict { fingerprint, incomplete } => {
                commands::cache::evict(&settings, &cache_root, fingerprint.as_deref(), incomplete)
            }
        },
    }
}
