//! Declared contents of an execution environment

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Everything that defines what gets installed into an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSpec {
    /// pip requirement specifiers (e.g. `ansible-core==2.16.3`)
    pub requirements: Vec<String>,

    /// Extra flags passed verbatim to `pip install`
    pub pip_install_options: Vec<String>,

    /// Package index URLs; the first is the primary index, the rest are extra indexes
    pub index_urls: Vec<String>,

    /// Interpreter version used to create the venv (`python3.11`); `None` uses `python3`
    pub python_version: Option<String>,

    /// Whether the venv can see the interpreter's site-packages
    pub system_site_packages: bool,

    /// Galaxy collections installed after provisioning, on every acquisition
    pub collections: Vec<String>,

    /// Cache root; `None` means an ephemeral environment
    pub cache_path: Option<PathBuf>,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            requirements: Vec::new(),
            pip_install_options: Vec::new(),
            index_urls: Vec::new(),
            python_version: None,
            system_site_packages: true,
            collections: Vec::new(),
            cache_path: None,
        }
    }
}

impl EnvironmentSpec {
    /// Normalized requirement list: trimmed, comments and blanks dropped, sorted, deduplicated
    ///
    /// The fingerprint is computed over this list, so two specs that only differ in
    /// requirement order or duplicates share an environment.
    #[must_use]
    pub fn requirements_list(&self) -> Vec<String> {
        self.requirements
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty() && !r.starts_with('#'))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Interpreter executable used to create the environment
    #[must_use]
    pub fn python_binary(&self) -> String {
        match &self.python_version {
            Some(version) => format!("python{version}"),
            None => "python3".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_list_normalizes() {
        let spec = EnvironmentSpec {
            requirements: vec![
                " ansible-runner ".to_string(),
                "# pinned below".to_string(),
                String::new(),
                "ansible-core==2.16.3".to_string(),
                "ansible-runner".to_string(),
            ],
            ..EnvironmentSpec::default()
        };

        assert_eq!(
            spec.requirements_list(),
            vec!["ansible-core==2.16.3".to_string(), "ansible-runner".to_string()]
        );
    }

    #[test]
    fn test_python_binary() {
        let mut spec = EnvironmentSpec::default();
        assert_eq!(spec.python_binary(), "python3");

        spec.python_version = Some("3.11".to_string());
        assert_eq!(spec.python_binary(), "python3.11");
    }

    #[test]
    fn test_deserialize_defaults() {
        let spec: EnvironmentSpec = serde_json::from_str(r#"{"requirements": ["pkgA==1.0"]}"#).unwrap();
        assert!(spec.system_site_packages);
        assert!(spec.cache_path.is_none());
        assert_eq!(spec.requirements, vec!["pkgA==1.0"]);
    }
}
