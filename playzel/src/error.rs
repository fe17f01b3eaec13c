//! Task-level error type

use convenient_ansible::{ConfigError, ReportError, RunError};
use convenient_venv::ProvisionError;
use thiserror::Error;

/// Anything that can end a task execution
#[derive(Debug, Error)]
pub enum TaskError {
    /// Configuration or credential problem, raised before anything runs
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The execution environment could not be provisioned
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// The engine could not be run
    #[error(transparent)]
    Run(#[from] RunError),

    /// The run finished without success, or its outputs could not be published
    #[error(transparent)]
    Report(#[from] ReportError),

    /// Blocking provisioning work did not complete
    #[error("Provisioning worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Interrupted before the run finished
    #[error("Task canceled")]
    Canceled,
}

impl TaskError {
    /// Terminal engine status, if the run itself failed
    #[must_use]
    pub fn run_status(&self) -> Option<&str> {
        match self {
            Self::Report(ReportError::Failed { status, .. }) => Some(status.as_str()),
            Self::Report(ReportError::Output { status, .. }) if !status.is_successful() => Some(status.as_str()),
            _ => None,
        }
    }
}

/// Result type for task execution
pub type Result<T> = std::result::Result<T, TaskError>;
