//! Playzel - playbook task runner with cached execution environments
//!
//! Playzel is a thin orchestration layer that combines:
//! - **convenient-venv**: fingerprinted, lock-protected virtual environments
//! - **convenient-ansible**: configuration resolution, `ansible-runner`
//!   invocation, event capture and result reporting
//!
//! ## Usage
//!
//! ```no_run
//! use playzel::{ConnectionStore, ExecutionContext, JsonFileChannel, Settings, TaskConfig, TaskPipeline};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load(None)?;
//! let connections = ConnectionStore::load(&settings.connections_file)?;
//! let task = TaskConfig::load(Path::new("deploy.yml"))?;
//! let context = ExecutionContext::load(Path::new("context.json"))?;
//! let mut outputs = JsonFileChannel::open("outputs/deploy.json")?;
//!
//! let pipeline = TaskPipeline::new(settings);
//! let report = pipeline.execute(&task, &context, &connections, &mut outputs).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod settings;
pub mod task;

pub use context::{ExecutionContext, JsonFileChannel};
pub use error::{Result, TaskError};
pub use settings::Settings;
pub use task::TaskPipeline;

// Re-export the types a task definition is made of
pub use convenient_ansible::{ConnectionStore, TaskConfig};
pub use convenient_venv::{EnvironmentSpec, Fingerprint};
