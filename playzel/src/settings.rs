//! Process-wide settings
//!
//! Loaded from `playzel.yml`:
//!
//! ```yaml
//! cache_key: "2024-06-rebuild"
//! connections_file: /etc/playzel/connections.yml
//! lock_timeout_secs: 900
//! default_vars:
//!   ansible_python_interpreter: /usr/bin/python3
//! ```

use convenient_ansible::{ConfigError, VarMap};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Settings file looked up in the working directory when none is given
pub const DEFAULT_SETTINGS_FILE: &str = "playzel.yml";

/// Settings shared by every task execution of this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Operator override folded into every fingerprint
    pub cache_key: Option<String>,
    /// Extra variables added to every run unless the run sets them
    pub default_vars: VarMap,
    /// YAML file of connections
    pub connections_file: PathBuf,
    /// How long to wait for another process building the same environment
    pub lock_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_key: None,
            default_vars: VarMap::new(),
            connections_file: PathBuf::from("connections.yml"),
            lock_timeout_secs: 600,
        }
    }
}

impl Settings {
    /// Parse settings from YAML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] on malformed input.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load settings
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_SETTINGS_FILE`]
    /// is used if present and defaults otherwise.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_SETTINGS_FILE);
                if !default.exists() {
                    debug!("No {} found, using default settings", DEFAULT_SETTINGS_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        debug!("Loading settings from {}", path.display());
        Self::from_yaml_str(&std::fs::read_to_string(&path)?)
    }

    /// Replace the cache key when one is given on the command line or environment
    #[must_use]
    pub fn with_cache_key(mut self, cache_key: Option<String>) -> Self {
        if cache_key.is_some() {
            self.cache_key = cache_key;
        }
        self
    }

    /// Bound on waiting for a concurrent build
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
