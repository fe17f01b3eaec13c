//! Playbook execution through `ansible-runner`
//!
//! Each run gets a private data directory laid out the way `ansible-runner`
//! expects (`env/`, `inventory/`, `project`). The engine is started from the
//! provisioned environment's `bin/` with `-j`, so every lifecycle event
//! arrives as one JSON object per stdout line and is handed to the
//! [`EventSink`] as soon as it is read.
//!
//! The child is spawned with `kill_on_drop`, so dropping the future returned
//! by [`PlaybookRunner::run`] terminates the engine.

use crate::config::{ExecutionConfig, Inventory};
use crate::credentials::Connection;
use crate::event::{EventSink, RunEvent};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine executable looked up in the environment's `bin/`
pub const RUNNER_BINARY: &str = "ansible-runner";

/// Prompts answered with the connection password
const PASSWORD_PROMPTS: [&str; 2] = [r"^SSH [pP]assword:\s*?$", r"^BECOME [pP]assword.*:\s*?$"];

/// Errors raised while running a playbook
///
/// A playbook that runs and fails is not an error here; it is a
/// [`RunResult`] with a non-successful [`RunStatus`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The engine process could not be started
    #[error("Playbook engine unavailable at {path}: {source}")]
    EngineUnavailable {
        /// Executable that was tried
        path: PathBuf,
        /// Spawn error
        source: std::io::Error,
    },

    /// Run inputs could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or pipe error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for run operations
pub type Result<T> = std::result::Result<T, RunError>;

/// Terminal status reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The only non-failing state
    Successful,
    /// At least one task failed
    Failed,
    /// A host could not be reached
    Unreachable,
    /// The run was canceled
    Canceled,
    /// `job_timeout` expired
    Timeout,
    /// Any other engine state
    Other(String),
}

impl RunStatus {
    /// Status string as the engine writes it
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Unreachable => "unreachable",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Other(s) => s,
        }
    }

    /// Whether the run counts as a success
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Successful)
    }
}

impl From<&str> for RunStatus {
    fn from(s: &str) -> Self {
        match s.trim() {
            "successful" => Self::Successful,
            "failed" => Self::Failed,
            "unreachable" => Self::Unreachable,
            "canceled" => Self::Canceled,
            "timeout" => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Terminal record of one run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run identifier passed as `--ident`
    pub ident: String,
    /// Terminal status
    pub status: RunStatus,
    /// Engine return code, when known
    pub rc: Option<i32>,
    /// When the engine was started
    pub started_at: DateTime<Utc>,
    /// When the engine exited
    pub finished_at: DateTime<Utc>,
    /// Wall time of the run
    pub duration: Duration,
    /// Full command line
    pub command: Vec<String>,
    /// Inventory as resolved
    pub inventory: Option<Inventory>,
    /// Playbook that was run
    pub playbook: String,
    /// Artifact directory; this run's artifacts are under `<ident>/`
    pub artifact_dir: PathBuf,
    /// Directory the playbook ran from
    pub project_dir: PathBuf,
    /// Private data directory the engine was pointed at
    pub private_data_dir: PathBuf,
    /// Whether the engine timed out
    pub timed_out: bool,
    /// Whether the run was canceled
    pub canceled: bool,
}

/// Starts `ansible-runner` from a provisioned environment
#[derive(Debug, Clone)]
pub struct PlaybookRunner {
    executable: String,
}

impl Default for PlaybookRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybookRunner {
    /// Runner using `ansible-runner`
    #[must_use]
    pub fn new() -> Self {
        Self {
            executable: RUNNER_BINARY.to_string(),
        }
    }

    /// Runner using a differently named executable in the same `bin/`
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Run the playbook described by `config`
    ///
    /// Events are pushed to `sink` in the order the engine emits them. The
    /// private data directory is removed before returning.
    ///
    /// # Errors
    ///
    /// [`RunError::EngineUnavailable`] if the engine cannot be started, or an
    /// I/O error while preparing the run or reading its output.
    pub async fn run(
        &self,
        config: &ExecutionConfig,
        bin_dir: &Path,
        connection: &Connection,
        sink: &mut dyn EventSink,
    ) -> Result<RunResult> {
        fs::create_dir_all(&config.artifact_dir).await?;

        let private_data_dir = tempfile::Builder::new().prefix("playzel-run-").tempdir()?;
        let inventories = prepare_private_data_dir(private_data_dir.path(), config, connection).await?;

        let ident = Uuid::new_v4().to_string();
        let program = bin_dir.join(&self.executable);
        let args = command_args(config, private_data_dir.path(), &ident, &inventories);

        let mut command = vec![program.to_string_lossy().into_owned()];
        command.extend(args.iter().cloned());

        info!(
            "Running playbook {} (ident {}, forks {}, tags {:?}, skip_tags {:?})",
            config.playbook, ident, config.forks, config.tags, config.skip_tags
        );
        debug!("command: {}", command.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .env("PATH", search_path(bin_dir))
            .env("VIRTUAL_ENV", bin_dir.parent().unwrap_or(bin_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::EngineUnavailable {
                path: program.clone(),
                source,
            })?;

        let started_at = Utc::now();
        let clock = Instant::now();

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).split(b'\n');
                while let Ok(Some(line)) = lines.next_segment().await {
                    debug!("engine stderr: {}", String::from_utf8_lossy(&line).trim_end());
                }
            })
        });

        // Engine output is not guaranteed to be UTF-8; a bad line must not end the run.
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).split(b'\n');
            loop {
                match lines.next_segment().await {
                    Ok(Some(line)) => forward_line(&String::from_utf8_lossy(&line), sink),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped reading engine output of {}: {}", ident, e);
                        break;
                    }
                }
            }
        }

        let exit = child.wait().await?;
        if let Some(task) = stderr_task
            && let Err(e) = task.await
        {
            warn!("stderr reader for {} failed: {}", ident, e);
        }

        let finished_at = Utc::now();
        let duration = clock.elapsed();

        let (status, rc) = read_terminal_status(&config.artifact_dir.join(&ident), exit.code()).await;
        info!(
            "Playbook {} finished with status {} (rc {:?}) in {:.1}s",
            config.playbook,
            status,
            rc,
            duration.as_secs_f64()
        );

        let private_data_path = private_data_dir.path().to_path_buf();
        if let Err(e) = private_data_dir.close() {
            warn!("Failed to remove {}: {}", private_data_path.display(), e);
        }

        Ok(RunResult {
            ident,
            timed_out: status == RunStatus::Timeout,
            canceled: status == RunStatus::Canceled,
            status,
            rc,
            started_at,
            finished_at,
            duration,
            command,
            inventory: config.inventory.clone(),
            playbook: config.playbook.clone(),
            artifact_dir: config.artifact_dir.clone(),
            project_dir: config.working_dir(),
            private_data_dir: private_data_path,
        })
    }
}

/// `--cmdline` value carrying tag filters, `None` when there are none
#[must_use]
pub fn tag_cmdline(tags: &[String], skip_tags: &[String]) -> Option<String> {
    let mut parts = Vec::new();
    if !tags.is_empty() {
        parts.push(format!("--tags {}", tags.join(",")));
    }
    if !skip_tags.is_empty() {
        parts.push(format!("--skip-tags {}", skip_tags.join(",")));
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn command_args(config: &ExecutionConfig, private_data_dir: &Path, ident: &str, inventories: &[PathBuf]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        private_data_dir.to_string_lossy().into_owned(),
        "-p".to_string(),
        config.playbook.clone(),
        "--ident".to_string(),
        ident.to_string(),
        "--artifact-dir".to_string(),
        config.artifact_dir.to_string_lossy().into_owned(),
        "--forks".to_string(),
        config.forks.to_string(),
    ];

    for inventory in inventories {
        args.push("--inventory".to_string());
        args.push(inventory.to_string_lossy().into_owned());
    }
    for roles in &config.roles_path {
        args.push("--roles-path".to_string());
        args.push(roles.to_string_lossy().into_owned());
    }
    if let Some(cmdline) = tag_cmdline(&config.tags, &config.skip_tags) {
        args.push("--cmdline".to_string());
        args.push(cmdline);
    }

    args.push("-j".to_string());
    args
}

/// Lay out `env/`, `inventory/` and `project` for the engine
///
/// Returns inventory paths to pass on the command line. Inline and INI
/// inventories are written into `inventory/` instead.
async fn prepare_private_data_dir(
    dir: &Path,
    config: &ExecutionConfig,
    connection: &Connection,
) -> Result<Vec<PathBuf>> {
    let env_dir = dir.join("env");
    fs::create_dir_all(&env_dir).await?;

    fs::write(env_dir.join("extravars"), serde_json::to_vec(&config.extravars)?).await?;

    if !config.envvars.is_empty() {
        fs::write(env_dir.join("envvars"), serde_json::to_vec(&config.envvars)?).await?;
    }

    if let Some(timeout) = config.timeout {
        fs::write(env_dir.join("settings"), serde_json::to_vec(&json!({ "job_timeout": timeout }))?).await?;
    }

    if let Some(key) = &connection.private_key {
        let key_path = env_dir.join("ssh_key");
        fs::write(&key_path, key).await?;
        fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    if let Some(password) = &connection.password {
        let passwords: serde_json::Map<String, Value> = PASSWORD_PROMPTS
            .iter()
            .map(|prompt| ((*prompt).to_string(), Value::from(password.clone())))
            .collect();
        let passwords_path = env_dir.join("passwords");
        fs::write(&passwords_path, serde_json::to_vec(&passwords)?).await?;
        fs::set_permissions(&passwords_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let inventories = match &config.inventory {
        Some(Inventory::Path(path)) => vec![path.clone()],
        Some(Inventory::Sources(sources)) => sources.clone(),
        Some(Inventory::Ini(ini)) => {
            fs::create_dir_all(dir.join("inventory")).await?;
            fs::write(dir.join("inventory").join("hosts"), &ini.ini).await?;
            Vec::new()
        }
        Some(Inventory::Inline(structure)) => {
            fs::create_dir_all(dir.join("inventory")).await?;
            fs::write(dir.join("inventory").join("hosts.json"), serde_json::to_vec(structure)?).await?;
            Vec::new()
        }
        None => Vec::new(),
    };

    fs::symlink(config.working_dir(), dir.join("project")).await?;

    Ok(inventories)
}

fn forward_line(line: &str, sink: &mut dyn EventSink) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(payload) if payload.is_object() => sink.on_event(RunEvent::from_payload(payload)),
        _ => debug!("engine: {}", line),
    }
}

/// Status and rc from the artifact files, falling back to the exit code
async fn read_terminal_status(run_artifacts: &Path, exit_code: Option<i32>) -> (RunStatus, Option<i32>) {
    let rc = fs::read_to_string(run_artifacts.join("rc"))
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .or(exit_code);

    let status = match fs::read_to_string(run_artifacts.join("status")).await {
        Ok(s) if !s.trim().is_empty() => RunStatus::from(s.as_str()),
        _ if rc == Some(0) => RunStatus::Successful,
        _ => RunStatus::Failed,
    };

    (status, rc)
}

fn search_path(bin_dir: &Path) -> std::ffi::OsString {
    let mut paths = vec![bin_dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_else(|_| bin_dir.as_os_str().to_os_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VarMap;
    use convenient_venv::EnvironmentSpec;
    use std::collections::BTreeMap;

    fn config() -> ExecutionConfig {
        ExecutionConfig {
            task_id: "deploy".to_string(),
            conn_id: "ansible_default".to_string(),
            playbook: "site.yml".to_string(),
            inventory: None,
            roles_path: vec![PathBuf::from("/srv/roles")],
            extravars: VarMap::new(),
            tags: vec!["web".to_string(), "db".to_string()],
            skip_tags: vec![],
            forks: 10,
            timeout: None,
            path: String::new(),
            project_dir: PathBuf::from("/srv/playbooks"),
            artifact_dir: PathBuf::from("/var/lib/artifacts"),
            envvars: BTreeMap::new(),
            track_hosts: false,
            environment: EnvironmentSpec::default(),
        }
    }

    #[test]
    fn test_tag_cmdline() {
        let tags = vec!["a".to_string(), "b".to_string()];
        let skip = vec!["c".to_string()];

        assert_eq!(tag_cmdline(&tags, &skip).as_deref(), Some("--tags a,b --skip-tags c"));
        assert_eq!(tag_cmdline(&[], &skip).as_deref(), Some("--skip-tags c"));
        assert_eq!(tag_cmdline(&[], &[]), None);
    }

    #[test]
    fn test_command_args() {
        let args = command_args(
            &config(),
            Path::new("/tmp/pdd"),
            "0b7f",
            &[PathBuf::from("/srv/playbooks/hosts")],
        );

        assert_eq!(
            args,
            vec![
                "run",
                "/tmp/pdd",
                "-p",
                "site.yml",
                "--ident",
                "0b7f",
                "--artifact-dir",
                "/var/lib/artifacts",
                "--forks",
                "10",
                "--inventory",
                "/srv/playbooks/hosts",
                "--roles-path",
                "/srv/roles",
                "--cmdline",
                "--tags web,db",
                "-j",
            ]
        );
    }

    #[test]
    fn test_status_strings() {
        assert!(RunStatus::from("successful\n").is_successful());
        assert_eq!(RunStatus::from("timeout"), RunStatus::Timeout);
        assert_eq!(RunStatus::from("starting"), RunStatus::Other("starting".to_string()));
        assert_eq!(RunStatus::Unreachable.to_string(), "unreachable");
    }

    #[tokio::test]
    async fn test_terminal_status_falls_back_to_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();

        assert_eq!(
            read_terminal_status(tmp.path(), Some(0)).await,
            (RunStatus::Successful, Some(0))
        );
        assert_eq!(read_terminal_status(tmp.path(), Some(4)).await, (RunStatus::Failed, Some(4)));

        std::fs::write(tmp.path().join("status"), "canceled").unwrap();
        std::fs::write(tmp.path().join("rc"), "254\n").unwrap();
        assert_eq!(
            read_terminal_status(tmp.path(), Some(0)).await,
            (RunStatus::Canceled, Some(254))
        );
    }
}
