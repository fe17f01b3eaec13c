//! Task configuration model
//!
//! [`TaskConfig`] is what a task definition declares. Any of its run
//! attributes may be a [`Deferrable::Deferred`] reference to an upstream
//! task's output. [`ExecutionConfig`] is the resolved form: it carries plain
//! values only, so nothing downstream of the resolver can observe a deferred
//! reference.

use convenient_venv::EnvironmentSpec;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Free-form variable map (extra vars, override bags, default vars)
pub type VarMap = serde_json::Map<String, Value>;

/// Connection used when a task does not name one
pub const DEFAULT_CONN_ID: &str = "ansible_default";

/// Default parallelism passed to the engine
pub const DEFAULT_FORKS: u32 = 10;

/// Errors detected while loading or resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A deferred reference points at an upstream value that does not exist
    #[error("Unresolved reference for {field}: no value '{key}' from task '{from_task}'")]
    UnresolvedReference {
        /// Field holding the reference
        field: String,
        /// Upstream task id
        from_task: String,
        /// Upstream output key
        key: String,
    },

    /// A required field has no value
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A value has the wrong shape for its field
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },

    /// The credential store has no such connection
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_output_key() -> String {
    "return_value".to_string()
}

/// Reference to an output of an upstream task
///
/// Only a mapping deserializes into a reference. A sequence never does, so
/// literal lists such as `tags: [web, db]` stay literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredRef {
    /// Upstream task id
    pub from_task: String,
    /// Output key, `return_value` unless given
    pub key: String,
}

impl<'de> Deserialize<'de> for DeferredRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(DeferredRefVisitor)
    }
}

struct DeferredRefVisitor;

impl<'de> Visitor<'de> for DeferredRefVisitor {
    type Value = DeferredRef;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping with `from_task` and an optional `key`")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<DeferredRef, A::Error> {
        const FIELDS: &[&str] = &["from_task", "key"];

        let mut from_task: Option<String> = None;
        let mut key: Option<String> = None;
        while let Some(name) = map.next_key::<String>()? {
            match name.as_str() {
                "from_task" if from_task.is_some() => return Err(de::Error::duplicate_field("from_task")),
                "from_task" => from_task = Some(map.next_value()?),
                "key" if key.is_some() => return Err(de::Error::duplicate_field("key")),
                "key" => key = Some(map.next_value()?),
                other => return Err(de::Error::unknown_field(other, FIELDS)),
            }
        }

        let Some(from_task) = from_task else {
            return Err(de::Error::missing_field("from_task"));
        };
        Ok(DeferredRef {
            from_task,
            key: key.unwrap_or_else(default_output_key),
        })
    }
}

/// A value that is either known now or produced by an upstream task
///
/// In YAML a mapping of exactly `from_task` (and optionally `key`) is a
/// reference; anything else is a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Deferrable<T> {
    /// Resolved against the execution context at run time
    Deferred(DeferredRef),
    /// Known at configuration time
    Literal(T),
}

impl<T> Deferrable<T> {
    /// Whether this still needs the execution context
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

/// Inventory in INI text form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IniInventory {
    /// INI inventory body
    pub ini: String,
}

/// Target inventory of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inventory {
    /// Inventory file, relative to the working directory unless absolute
    Path(PathBuf),
    /// Several inventory sources
    Sources(Vec<PathBuf>),
    /// Literal INI text
    Ini(IniInventory),
    /// YAML/JSON inventory structure
    Inline(VarMap),
}

impl Inventory {
    /// Anchor relative paths at `base`
    #[must_use]
    pub fn anchored_at(self, base: &Path) -> Self {
        match self {
            Self::Path(p) => Self::Path(base.join(p)),
            Self::Sources(sources) => Self::Sources(sources.into_iter().map(|p| base.join(p)).collect()),
            other => other,
        }
    }
}

/// Task definition as declared, possibly holding deferred references
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Task id, used for logging and output keys
    pub task_id: String,
    /// Connection supplying credentials and default directories
    pub conn_id: String,

    /// Playbook file, relative to the working directory
    pub playbook: Option<Deferrable<String>>,
    /// Target inventory
    pub inventory: Option<Deferrable<Inventory>>,
    /// Additional role search paths
    pub roles_path: Option<Deferrable<Vec<PathBuf>>>,
    /// Extra variables passed with `-e`
    pub extravars: Option<Deferrable<VarMap>>,
    /// Only run tasks with these tags
    pub tags: Option<Deferrable<Vec<String>>>,
    /// Skip tasks with these tags
    pub skip_tags: Option<Deferrable<Vec<String>>>,
    /// Where the engine writes run artifacts
    pub artifact_dir: Option<Deferrable<PathBuf>>,
    /// Project checkout holding the playbooks
    pub project_dir: Option<Deferrable<PathBuf>>,
    /// Working path inside the project
    pub path: Option<Deferrable<String>>,
    /// Record the latest event per host
    #[serde(alias = "get_ci_events")]
    pub track_hosts: Option<Deferrable<bool>>,
    /// Engine parallelism
    pub forks: Option<Deferrable<u32>>,
    /// Engine job timeout in seconds
    #[serde(alias = "ansible_timeout")]
    pub timeout: Option<Deferrable<u64>>,

    /// Fallback values for any of the fields above left unset
    pub ansible_vars: Option<Deferrable<VarMap>>,

    /// Environment variables for the engine process
    pub envvars: BTreeMap<String, String>,
    /// Execution environment contents
    pub environment: EnvironmentSpec,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            conn_id: DEFAULT_CONN_ID.to_string(),
            playbook: None,
            inventory: None,
            roles_path: None,
            extravars: None,
            tags: None,
            skip_tags: None,
            artifact_dir: None,
            project_dir: None,
            path: None,
            track_hosts: None,
            forks: None,
            timeout: None,
            ansible_vars: None,
            envvars: BTreeMap::new(),
            environment: EnvironmentSpec::default(),
        }
    }
}

impl TaskConfig {
    /// Parse a task definition from YAML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] on malformed input.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load a task definition from a YAML file
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// Fully resolved attributes of one playbook run
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionConfig {
    /// Task id
    pub task_id: String,
    /// Connection the credentials come from
    pub conn_id: String,
    /// Playbook file, relative to the working directory
    pub playbook: String,
    /// Inventory with relative paths already anchored
    pub inventory: Option<Inventory>,
    /// Additional role search paths
    pub roles_path: Vec<PathBuf>,
    /// Extra variables including connection and default vars
    pub extravars: VarMap,
    /// Only run tasks with these tags
    pub tags: Vec<String>,
    /// Skip tasks with these tags
    pub skip_tags: Vec<String>,
    /// Engine parallelism
    pub forks: u32,
    /// Engine job timeout in seconds
    pub timeout: Option<u64>,
    /// Working path inside the project
    pub path: String,
    /// Project checkout
    pub project_dir: PathBuf,
    /// Artifact output directory
    pub artifact_dir: PathBuf,
    /// Environment variables for the engine process
    pub envvars: BTreeMap<String, String>,
    /// Record the latest event per host
    pub track_hosts: bool,
    /// Execution environment contents
    pub environment: EnvironmentSpec,
}

impl ExecutionConfig {
    /// Directory the playbook runs from: `project_dir/path`
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.project_dir.join(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_and_deferred_fields() {
        let yaml = r#"
task_id: deploy
playbook: site.yml
inventory: hosts.ini
tags: [web, db]
extravars:
  from_task: prepare
  key: vars
forks: 5
get_ci_events: true
ansible_timeout: 600
environment:
  requirements: ["ansible-core==2.16.3", "ansible-runner"]
  system_site_packages: false
"#;
        let config = TaskConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.conn_id, DEFAULT_CONN_ID);
        assert_eq!(config.playbook, Some(Deferrable::Literal("site.yml".to_string())));
        assert_eq!(
            config.inventory,
            Some(Deferrable::Literal(Inventory::Path(PathBuf::from("hosts.ini"))))
        );
        assert_eq!(
            config.extravars,
            Some(Deferrable::Deferred(DeferredRef {
                from_task: "prepare".to_string(),
                key: "vars".to_string(),
            }))
        );
        assert_eq!(config.track_hosts, Some(Deferrable::Literal(true)));
        assert_eq!(config.timeout, Some(Deferrable::Literal(600)));
        assert_eq!(config.environment.requirements.len(), 2);
        assert!(!config.environment.system_site_packages);
    }

    #[test]
    fn test_reference_key_defaults_to_return_value() {
        let config = TaskConfig::from_yaml_str("playbook: {from_task: pick_playbook}").unwrap();
        match config.playbook {
            Some(Deferrable::Deferred(r)) => {
                assert_eq!(r.from_task, "pick_playbook");
                assert_eq!(r.key, "return_value");
            }
            other => panic!("expected a deferred reference, got {other:?}"),
        }
    }

    #[test]
    fn test_literal_lists_are_not_references() {
        let config =
            TaskConfig::from_yaml_str("tags: [web, db]\nskip_tags: [slow]\nroles_path: [/srv/roles]\ninventory: [a.ini, b.yml]")
                .unwrap();

        assert_eq!(
            config.tags,
            Some(Deferrable::Literal(vec!["web".to_string(), "db".to_string()]))
        );
        assert_eq!(config.skip_tags, Some(Deferrable::Literal(vec!["slow".to_string()])));
        assert_eq!(
            config.roles_path,
            Some(Deferrable::Literal(vec![PathBuf::from("/srv/roles")]))
        );
        assert_eq!(
            config.inventory,
            Some(Deferrable::Literal(Inventory::Sources(vec![
                PathBuf::from("a.ini"),
                PathBuf::from("b.yml"),
            ])))
        );
    }

    #[test]
    fn test_reference_rejects_unknown_and_missing_fields() {
        assert!(serde_json::from_value::<DeferredRef>(serde_json::json!({"key": "vars"})).is_err());
        assert!(serde_json::from_value::<DeferredRef>(serde_json::json!({"from_task": "a", "extra": 1})).is_err());
        assert!(serde_json::from_value::<DeferredRef>(serde_json::json!(["a", "b"])).is_err());
    }

    #[test]
    fn test_map_with_other_keys_is_literal() {
        let config = TaskConfig::from_yaml_str("extravars: {from_task: x, region: eu}").unwrap();
        assert!(matches!(config.extravars, Some(Deferrable::Literal(_))));
    }

    #[test]
    fn test_inventory_shapes() {
        let ini: Inventory = serde_yaml::from_str("ini: \"[web]\\nweb1\\n\"").unwrap();
        assert!(matches!(ini, Inventory::Ini(_)));

        let inline: Inventory = serde_yaml::from_str("all: {hosts: {web1: {}}}").unwrap();
        assert!(matches!(inline, Inventory::Inline(_)));

        let sources: Inventory = serde_yaml::from_str("[a.ini, b.yml]").unwrap();
        assert!(matches!(sources, Inventory::Sources(ref s) if s.len() == 2));
    }

    #[test]
    fn test_anchoring_keeps_absolute_paths() {
        let base = Path::new("/srv/project/deploy");
        assert_eq!(
            Inventory::Path(PathBuf::from("hosts")).anchored_at(base),
            Inventory::Path(PathBuf::from("/srv/project/deploy/hosts"))
        );
        assert_eq!(
            Inventory::Path(PathBuf::from("/etc/ansible/hosts")).anchored_at(base),
            Inventory::Path(PathBuf::from("/etc/ansible/hosts"))
        );
    }
}
