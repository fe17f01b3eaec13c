//! Execution context and task outputs
//!
//! The host platform hands each task execution a JSON context holding its
//! identifiers and the outputs of upstream tasks:
//!
//! ```json
//! {
//!   "run_id": "manual__2024-06-01T12:00:00",
//!   "task_id": "deploy",
//!   "upstream": { "prepare": { "return_value": { "region": "eu-west-1" } } }
//! }
//! ```
//!
//! Outputs go to a [`JsonFileChannel`], one file per task instance.

use convenient_ansible::{ConfigError, OutputChannel, OutputError, UpstreamValues, VarMap};
use convenient_venv::lock::atomic_write;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Run-time view of the surrounding workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    /// Correlation id of the workflow run
    pub run_id: String,
    /// Id of the task being executed
    pub task_id: String,
    /// Upstream task id to its published outputs
    pub upstream: BTreeMap<String, VarMap>,
}

impl ExecutionContext {
    /// Parse a context from JSON
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] on malformed input.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a context from a JSON file
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

impl UpstreamValues for ExecutionContext {
    fn upstream(&self, task_id: &str, key: &str) -> Option<Value> {
        self.upstream.upstream(task_id, key)
    }
}

/// Write-once outputs persisted to a JSON file
#[derive(Debug)]
pub struct JsonFileChannel {
    path: PathBuf,
    values: BTreeMap<String, Value>,
}

impl JsonFileChannel {
    /// Open the channel at `path`, keeping values already written there
    ///
    /// # Errors
    ///
    /// Fails if an existing file cannot be read or is not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };
        debug!("Opened output channel {} with {} values", path.display(), values.len());
        Ok(Self { path, values })
    }

    /// Value published under `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// File backing this channel
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputChannel for JsonFileChannel {
    fn push(&mut self, key: &str, value: Value) -> Result<(), OutputError> {
        if self.values.contains_key(key) {
            return Err(OutputError::AlreadyWritten(key.to_string()));
        }
        self.values.insert(key.to_string(), value);

        let data = serde_json::to_vec_pretty(&self.values).map_err(|e| OutputError::Persist(e.to_string()))?;
        atomic_write(&self.path, &data).map_err(|e| OutputError::Persist(e.to_string()))?;
        info!("Published output {} to {}", key, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_context_upstream_lookup() {
        let ctx = ExecutionContext::from_json_str(
            r#"{"run_id": "r1", "task_id": "deploy", "upstream": {"prepare": {"return_value": ["web"]}}}"#,
        )
        .unwrap();

        assert_eq!(ctx.upstream("prepare", "return_value"), Some(json!(["web"])));
        assert_eq!(ctx.upstream("prepare", "other"), None);
        assert_eq!(ctx.upstream("missing", "return_value"), None);
    }

    #[test]
    fn test_json_channel_persists_and_is_write_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("outputs").join("deploy.json");

        let mut channel = JsonFileChannel::open(&path).unwrap();
        channel.push("runner_id", json!("abc")).unwrap();
        assert!(matches!(
            channel.push("runner_id", json!("def")),
            Err(OutputError::AlreadyWritten(_))
        ));

        let reopened = JsonFileChannel::open(&path).unwrap();
        assert_eq!(reopened.get("runner_id"), Some(&json!("abc")));
    }
}
