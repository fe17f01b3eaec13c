//! Environment builders
//!
//! The provisioner decides *when* to build; a builder knows *how*. The
//! production [`VenvBuilder`] shells out to `python -m venv`, `pip` and
//! `ansible-galaxy`. Tests swap in builders that only touch the filesystem.

use crate::spec::EnvironmentSpec;
use crate::{ProvisionError, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Creates environments and installs packages into them
pub trait EnvironmentBuilder: Send + Sync {
    /// Create an empty runtime environment at `target`
    fn create(&self, target: &Path, spec: &EnvironmentSpec) -> Result<()>;

    /// Install the declared requirement list into the environment at `target`
    fn install_requirements(&self, target: &Path, spec: &EnvironmentSpec) -> Result<()>;

    /// Install one named collection into the environment at `target`
    fn install_collection(&self, target: &Path, collection: &str) -> Result<()>;
}

/// Builds Python virtual environments with the interpreter found on `PATH`
#[derive(Debug, Clone, Default)]
pub struct VenvBuilder;

impl VenvBuilder {
    /// Create a venv builder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn pip_args(target: &Path, spec: &EnvironmentSpec) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        args.extend(spec.pip_install_options.iter().cloned());

        let mut urls = spec.index_urls.iter();
        if let Some(primary) = urls.next() {
            args.push("--index-url".to_string());
            args.push(primary.clone());
        }
        for extra in urls {
            args.push("--extra-index-url".to_string());
            args.push(extra.clone());
        }

        args.push("-r".to_string());
        args.push(target.join("requirements.txt").to_string_lossy().into_owned());
        args
    }
}

impl EnvironmentBuilder for VenvBuilder {
    fn create(&self, target: &Path, spec: &EnvironmentSpec) -> Result<()> {
        let python = spec.python_binary();
        info!("Creating virtual environment at {} with {}", target.display(), python);

        let mut cmd = Command::new(&python);
        cmd.arg("-m").arg("venv");
        if spec.system_site_packages {
            cmd.arg("--system-site-packages");
        }
        cmd.arg(target);

        run(cmd).map_err(|reason| ProvisionError::VenvCreation {
            path: target.to_path_buf(),
            reason,
        })
    }

    fn install_requirements(&self, target: &Path, spec: &EnvironmentSpec) -> Result<()> {
        let requirements = spec.requirements_list();
        if requirements.is_empty() {
            debug!("No requirements to install into {}", target.display());
            return Ok(());
        }

        fs::write(target.join("requirements.txt"), requirements.join("\n"))?;
        info!("Installing {} requirements into {}", requirements.len(), target.display());

        let mut cmd = Command::new(target.join("bin").join("pip"));
        cmd.args(Self::pip_args(target, spec));

        run(cmd).map_err(|reason| ProvisionError::Install {
            path: target.to_path_buf(),
            reason,
        })
    }

    fn install_collection(&self, target: &Path, collection: &str) -> Result<()> {
        info!("Installing collection {} into {}", collection, target.display());

        let mut cmd = Command::new(target.join("bin").join("ansible-galaxy"));
        cmd.args(["collection", "install", collection])
            // Collections land under $HOME/.ansible, keep them inside the environment
            .env("HOME", target);

        run(cmd).map_err(|reason| ProvisionError::CollectionInstall {
            collection: collection.to_string(),
            reason,
        })
    }
}

/// Run a command to completion, returning stderr as the failure reason
fn run(mut cmd: Command) -> std::result::Result<(), String> {
    debug!("Running {:?}", cmd);

    let output = cmd.output().map_err(|e| format!("{}: {e}", cmd.get_program().to_string_lossy()))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(match output.status.code() {
        Some(code) => format!("exit code {code}: {stderr}"),
        None => format!("terminated by signal: {stderr}"),
    })
}
