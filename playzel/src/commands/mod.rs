//! Playzel command-line interface
//!
//! - `run`: execute a task definition
//! - `fingerprint`: show the environment fingerprint of a task definition
//! - `cache`: inspect and evict cached environments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod cache;
pub mod fingerprint;
pub mod run;

/// Playzel - playbook task runner with cached execution environments
#[derive(Parser)]
#[command(name = "playzel")]
#[command(about = "Run Ansible playbooks in fingerprinted, cached virtual environments")]
#[command(version)]
pub struct Cli {
    /// Settings file (defaults to ./playzel.yml when present)
    #[arg(short, long, global = true, env = "PLAYZEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache key folded into every fingerprint, overrides the settings file
    #[arg(long, global = true, env = "PLAYZEL_CACHE_KEY")]
    pub cache_key: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a task definition
    Run {
        /// Task definition (YAML)
        task: PathBuf,

        /// Execution context with upstream outputs (JSON)
        #[arg(long)]
        context: Option<PathBuf>,

        /// File the task's outputs are published to
        #[arg(long, default_value = "outputs.json")]
        outputs: PathBuf,
    },

    /// Print the environment fingerprint and its canonical form
    Fingerprint {
        /// Task definition (YAML)
        task: PathBuf,
    },

    /// Cache management operations
    Cache {
        /// Cache root holding the environments
        #[arg(long, env = "PLAYZEL_CACHE_ROOT")]
        cache_root: PathBuf,

        #[command(subcommand)]
        operation: CacheOperation,
    },
}

#[derive(Subcommand)]
pub enum CacheOperation {
    /// List cached environments and their sizes
    Info,

    /// Remove cached environments
    Evict {
        /// Fingerprint to remove
        #[arg(required_unless_present = "incomplete")]
        fingerprint: Option<String>,

        /// Remove every environment without a completion marker instead
        #[arg(long, conflicts_with = "fingerprint")]
        incomplete: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["playzel", "run", "deploy.yml", "--context", "ctx.json"]);
        match cli.command {
            Commands::Run { task, context, outputs } => {
                assert_eq!(task, PathBuf::from("deploy.yml"));
                assert_eq!(context, Some(PathBuf::from("ctx.json")));
                assert_eq!(outputs, PathBuf::from("outputs.json"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_evict_requires_target() {
        assert!(Cli::try_parse_from(["playzel", "cache", "--cache-root", "/c", "evict"]).is_err());
        assert!(Cli::try_parse_from(["playzel", "cache", "--cache-root", "/c", "evict", "--incomplete"]).is_ok());
    }
}
