//! Result reporting
//!
//! [`finalize`] turns a [`RunResult`] and the recorded events into the task's
//! output map, publishes the run identifier for downstream consumers, and
//! classifies the outcome.

use crate::event::EventAggregator;
use crate::runner::{RunResult, RunStatus};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info};

/// Output key the run identifier is published under
pub const RUNNER_ID_KEY: &str = "runner_id";

/// Errors from an [`OutputChannel`]
#[derive(Debug, Error)]
pub enum OutputError {
    /// Keys can only be written once per task instance
    #[error("Output '{0}' was already written")]
    AlreadyWritten(String),

    /// Backing store could not be written
    #[error("Failed to persist output: {0}")]
    Persist(String),
}

/// Errors raised while reporting a run
#[derive(Debug, Error)]
pub enum ReportError {
    /// The run ended in a non-successful state; the report is attached
    #[error("Ansible run playbook failed: {status}")]
    Failed {
        /// Terminal status
        status: RunStatus,
        /// Everything known about the run
        report: Box<Value>,
    },

    /// The run identifier could not be published; the report is attached
    #[error("Failed to publish run id of a {status} run: {source}")]
    Output {
        /// Channel failure
        source: OutputError,
        /// Terminal status of the run
        status: RunStatus,
        /// Everything known about the run
        report: Box<Value>,
    },
}

impl ReportError {
    /// The report assembled before the error was raised
    #[must_use]
    pub fn report(&self) -> &Value {
        match self {
            Self::Failed { report, .. } | Self::Output { report, .. } => report,
        }
    }
}

/// Write-once key/value outputs of one task instance
pub trait OutputChannel: Send {
    /// Publish `value` under `key`
    ///
    /// # Errors
    ///
    /// [`OutputError::AlreadyWritten`] if `key` already has a value.
    fn push(&mut self, key: &str, value: Value) -> Result<(), OutputError>;
}

/// In-memory output channel
#[derive(Debug, Default)]
pub struct MemoryChannel {
    values: BTreeMap<String, Value>,
}

impl MemoryChannel {
    /// Empty channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value published under `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl OutputChannel for MemoryChannel {
    fn push(&mut self, key: &str, value: Value) -> Result<(), OutputError> {
        if self.values.contains_key(key) {
            return Err(OutputError::AlreadyWritten(key.to_string()));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Assemble the report, publish the run id and classify the outcome
///
/// # Errors
///
/// [`ReportError::Failed`] for every status other than `successful`, with the
/// complete report attached; [`ReportError::Output`], also carrying the
/// report, if the run id cannot be published.
pub fn finalize(
    result: &RunResult,
    events: &EventAggregator,
    outputs: &mut dyn OutputChannel,
) -> Result<Value, ReportError> {
    let report = build_report(result, events);

    if let Err(source) = outputs.push(RUNNER_ID_KEY, Value::from(result.ident.clone())) {
        error!("Failed to publish run id {}: {}", result.ident, source);
        return Err(ReportError::Output {
            source,
            status: result.status.clone(),
            report: Box::new(report),
        });
    }

    if result.status.is_successful() {
        info!("Playbook {} succeeded (ident {})", result.playbook, result.ident);
        return Ok(report);
    }

    error!(
        "Playbook {} ended with status {} (ident {}, artifacts in {})",
        result.playbook,
        result.status,
        result.ident,
        result.artifact_dir.join(&result.ident).display()
    );
    Err(ReportError::Failed {
        status: result.status.clone(),
        report: Box::new(report),
    })
}

fn build_report(result: &RunResult, events: &EventAggregator) -> Value {
    let ci_events: serde_json::Map<String, Value> = events
        .host_events()
        .iter()
        .map(|(host, event)| (host.clone(), event.payload.clone()))
        .collect();

    json!({
        "ident": result.ident,
        "status": result.status,
        "rc": result.rc,
        "canceled": result.canceled,
        "timed_out": result.timed_out,
        "started_at": result.started_at.to_rfc3339(),
        "finished_at": result.finished_at.to_rfc3339(),
        "duration_secs": result.duration.as_secs_f64(),
        "command": result.command,
        "inventory": result.inventory,
        "playbook": result.playbook,
        "artifact_dir": result.artifact_dir,
        "project_dir": result.project_dir,
        "private_data_dir": result.private_data_dir,
        "last_event": events.last_event().map_or(Value::Null, |e| e.payload.clone()),
        "ci_events": ci_events,
    })
}
