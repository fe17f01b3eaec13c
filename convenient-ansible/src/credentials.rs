//! Connection credentials for target hosts
//!
//! A [`ConnectionProvider`] maps a connection id to the user, port and
//! secrets used to reach the inventory, plus the default project and artifact
//! directories. [`ConnectionStore`] reads them from a YAML file:
//!
//! ```yaml
//! ansible_default:
//!   username: deploy
//!   ssh_port: 2222
//!   private_key_file: /etc/playzel/keys/deploy
//!   project_directory: /srv/playbooks
//!   artifact_directory: /var/lib/playzel/artifacts
//! ```

use crate::config::{ConfigError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

fn default_ssh_port() -> u16 {
    22
}

/// Credentials and defaults for one connection
#[derive(Clone, Default)]
pub struct Connection {
    /// Remote user (`ansible_user`)
    pub username: String,
    /// SSH port (`ansible_port`)
    pub ssh_port: u16,
    /// Private key material
    pub private_key: Option<String>,
    /// Password answered to SSH prompts
    pub password: Option<String>,
    /// Default project directory
    pub project_directory: Option<PathBuf>,
    /// Default artifact directory
    pub artifact_directory: Option<PathBuf>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("username", &self.username)
            .field("ssh_port", &self.ssh_port)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("project_directory", &self.project_directory)
            .field("artifact_directory", &self.artifact_directory)
            .finish()
    }
}

/// Source of connection credentials
pub trait ConnectionProvider: Send + Sync {
    /// Look up a connection by id
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownConnection`] if the id is not defined, or an I/O
    /// error if referenced key material cannot be read.
    fn connection(&self, conn_id: &str) -> Result<Connection>;
}

/// Private keys read from disk, kept for the lifetime of the cache
///
/// Owned by whoever needs key material and passed explicitly; several
/// connections sharing a key file read it once.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: Mutex<HashMap<PathBuf, String>>,
}

impl KeyCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Key material at `path`, reading the file on first use
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub fn get_or_load(&self, path: &Path) -> Result<String> {
        let mut keys = self
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(key) = keys.get(path) {
            return Ok(key.clone());
        }

        debug!("Loading private key from {}", path.display());
        let key = std::fs::read_to_string(path)?;
        keys.insert(path.to_path_buf(), key.clone());
        Ok(key)
    }

    /// Number of cached keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no key has been loaded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionEntry {
    username: String,
    #[serde(default = "default_ssh_port")]
    ssh_port: u16,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    private_key_file: Option<PathBuf>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    project_directory: Option<PathBuf>,
    #[serde(default)]
    artifact_directory: Option<PathBuf>,
}

/// Connections loaded from a YAML file
#[derive(Debug, Default)]
pub struct ConnectionStore {
    entries: HashMap<String, ConnectionEntry>,
    keys: KeyCache,
}

impl ConnectionStore {
    /// Parse connections from YAML, keyed by connection id
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] on malformed input.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(Self {
            entries: serde_yaml::from_str(content)?,
            keys: KeyCache::new(),
        })
    }

    /// Load connections from a YAML file
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Key cache shared by all connections of this store
    #[must_use]
    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }
}

impl ConnectionProvider for ConnectionStore {
    fn connection(&self, conn_id: &str) -> Result<Connection> {
        let entry = self
            .entries
            .get(conn_id)
            .ok_or_else(|| ConfigError::UnknownConnection(conn_id.to_string()))?;

        let private_key = match (&entry.private_key, &entry.private_key_file) {
            (Some(inline), _) => Some(inline.clone()),
            (None, Some(path)) => Some(self.keys.get_or_load(path)?),
            (None, None) => None,
        };

        Ok(Connection {
            username: entry.username.clone(),
            ssh_port: entry.ssh_port,
            private_key,
            password: entry.password.clone(),
            project_directory: entry.project_directory.clone(),
            artifact_directory: entry.artifact_directory.clone(),
        })
    }
}
