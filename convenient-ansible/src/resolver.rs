//! Resolution of a [`TaskConfig`] into an [`ExecutionConfig`]
//!
//! Order of operations:
//!
//! 1. `ansible_vars` is resolved first. Every run attribute the task leaves
//!    unset falls back to the entry of the same name in that bag.
//! 2. Remaining deferred references are looked up in the execution context.
//! 3. Connection variables are written into `extravars`, then default vars
//!    fill in keys that are still absent.
//! 4. A relative inventory is anchored at `project_dir/path`.

use crate::config::{
    ConfigError, DEFAULT_FORKS, Deferrable, ExecutionConfig, Inventory, Result, TaskConfig, VarMap,
};
use crate::credentials::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, info};

/// Outputs of upstream tasks, available at run time
pub trait UpstreamValues {
    /// Value published by `task_id` under `key`
    fn upstream(&self, task_id: &str, key: &str) -> Option<Value>;
}

impl UpstreamValues for BTreeMap<String, VarMap> {
    fn upstream(&self, task_id: &str, key: &str) -> Option<Value> {
        self.get(task_id).and_then(|outputs| outputs.get(key)).cloned()
    }
}

impl UpstreamValues for HashMap<String, VarMap> {
    fn upstream(&self, task_id: &str, key: &str) -> Option<Value> {
        self.get(task_id).and_then(|outputs| outputs.get(key)).cloned()
    }
}

/// Resolve every deferred value of `task`
///
/// `defaults` is the process-wide default variable table; its entries are
/// added to `extravars` for keys the run does not set.
///
/// # Errors
///
/// Fails before anything is executed when a reference cannot be resolved, a
/// value has the wrong shape, or a required field (`playbook`,
/// `project_dir`, `artifact_dir`) ends up without a value.
pub fn resolve(
    task: &TaskConfig,
    context: &dyn UpstreamValues,
    defaults: &VarMap,
    connection: &Connection,
) -> Result<ExecutionConfig> {
    let bag = match &task.ansible_vars {
        Some(vars) => resolve_value(vars, "ansible_vars", context)?,
        None => VarMap::new(),
    };
    let fields = Fields { bag: &bag, context };

    let playbook: String = fields.pick(task.playbook.as_ref(), &["playbook"])?.unwrap_or_default();
    if playbook.trim().is_empty() {
        return Err(ConfigError::MissingField("playbook".to_string()));
    }

    let project_dir: PathBuf = fields
        .pick(task.project_dir.as_ref(), &["project_dir"])?
        .or_else(|| connection.project_directory.clone())
        .ok_or_else(|| ConfigError::MissingField("project_dir".to_string()))?;
    let artifact_dir: PathBuf = fields
        .pick(task.artifact_dir.as_ref(), &["artifact_dir"])?
        .or_else(|| connection.artifact_directory.clone())
        .ok_or_else(|| ConfigError::MissingField("artifact_dir".to_string()))?;

    let path: String = fields.pick(task.path.as_ref(), &["path"])?.unwrap_or_default();

    let forks: u32 = fields.pick(task.forks.as_ref(), &["forks"])?.unwrap_or(DEFAULT_FORKS);
    if forks == 0 {
        return Err(ConfigError::InvalidValue {
            field: "forks".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    let mut extravars: VarMap = fields.pick(task.extravars.as_ref(), &["extravars"])?.unwrap_or_default();
    inject_connection_vars(&mut extravars, connection);
    for (key, value) in defaults {
        if !extravars.contains_key(key) {
            extravars.insert(key.clone(), value.clone());
        }
    }

    let working_dir = project_dir.join(&path);
    let inventory = fields
        .pick::<Inventory>(task.inventory.as_ref(), &["inventory"])?
        .map(|inv| inv.anchored_at(&working_dir));

    let config = ExecutionConfig {
        task_id: task.task_id.clone(),
        conn_id: task.conn_id.clone(),
        playbook,
        inventory,
        roles_path: fields.pick(task.roles_path.as_ref(), &["roles_path"])?.unwrap_or_default(),
        extravars,
        tags: fields.pick(task.tags.as_ref(), &["tags"])?.unwrap_or_default(),
        skip_tags: fields.pick(task.skip_tags.as_ref(), &["skip_tags"])?.unwrap_or_default(),
        forks,
        timeout: fields.pick(task.timeout.as_ref(), &["timeout", "ansible_timeout"])?,
        path,
        project_dir,
        artifact_dir,
        envvars: task.envvars.clone(),
        track_hosts: fields
            .pick(task.track_hosts.as_ref(), &["track_hosts", "get_ci_events"])?
            .unwrap_or(false),
        environment: task.environment.clone(),
    };

    info!(
        "Resolved task {}: project_dir: {}, path: {}, playbook: {}",
        config.task_id,
        config.project_dir.display(),
        config.path,
        config.playbook
    );
    Ok(config)
}

fn inject_connection_vars(extravars: &mut VarMap, connection: &Connection) {
    extravars.insert("ansible_user".to_string(), Value::from(connection.username.clone()));
    extravars.insert("ansible_port".to_string(), Value::from(connection.ssh_port));
    extravars.insert("ansible_connection".to_string(), Value::from("ssh"));
}

struct Fields<'a> {
    bag: &'a VarMap,
    context: &'a dyn UpstreamValues,
}

impl Fields<'_> {
    /// Explicit value if set, else the first matching bag entry
    fn pick<T: DeserializeOwned + Clone>(
        &self,
        explicit: Option<&Deferrable<T>>,
        names: &[&str],
    ) -> Result<Option<T>> {
        let field = names.first().copied().unwrap_or_default();

        if let Some(value) = explicit {
            return resolve_value(value, field, self.context).map(Some);
        }

        let Some((name, raw)) = names
            .iter()
            .find_map(|name| self.bag.get(*name).map(|raw| (*name, raw)))
        else {
            return Ok(None);
        };

        debug!("Taking {} from ansible_vars", name);
        let value: Deferrable<T> = serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
        resolve_value(&value, field, self.context).map(Some)
    }
}

fn resolve_value<T: DeserializeOwned + Clone>(
    value: &Deferrable<T>,
    field: &str,
    context: &dyn UpstreamValues,
) -> Result<T> {
    match value {
        Deferrable::Literal(v) => Ok(v.clone()),
        Deferrable::Deferred(reference) => {
            let raw = context
                .upstream(&reference.from_task, &reference.key)
                .ok_or_else(|| ConfigError::UnresolvedReference {
                    field: field.to_string(),
                    from_task: reference.from_task.clone(),
                    key: reference.key.clone(),
                })?;
            debug!("Resolved {} from {}.{}", field, reference.from_task, reference.key);
            serde_json::from_value(raw).map_err(|e| ConfigError::InvalidValue {
                field: field.to_string(),
                reason: e.to_string(),
            })
        }
    }
}
