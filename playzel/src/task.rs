//! Task execution pipeline
//!
//! resolve → fingerprint → provision → run → report, strictly in that order.
//! The environment is released on every exit path once acquired. If the
//! execution future is dropped instead, the engine child is killed and an
//! ephemeral environment is removed when its handle drops.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::settings::Settings;
use convenient_ansible::{
    Connection, ConnectionProvider, EventAggregator, ExecutionConfig, OutputChannel, PlaybookRunner, TaskConfig,
    finalize, resolve,
};
use convenient_venv::{EnvironmentBuilder, EnvironmentHandle, EnvironmentSpec, Provisioner, VenvBuilder, fingerprint};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs tasks against a shared provisioner
pub struct TaskPipeline<B: EnvironmentBuilder + 'static = VenvBuilder> {
    provisioner: Arc<Provisioner<B>>,
    runner: PlaybookRunner,
    settings: Settings,
}

impl TaskPipeline<VenvBuilder> {
    /// Pipeline building real virtual environments
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let provisioner = Provisioner::new().with_lock_timeout(settings.lock_timeout());
        Self::with_provisioner(settings, provisioner)
    }
}

impl<B: EnvironmentBuilder + 'static> TaskPipeline<B> {
    /// Pipeline using a custom provisioner
    pub fn with_provisioner(settings: Settings, provisioner: Provisioner<B>) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
            runner: PlaybookRunner::new(),
            settings,
        }
    }

    /// Replace the playbook runner
    #[must_use]
    pub fn with_runner(mut self, runner: PlaybookRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Settings the pipeline was built with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute one task
    ///
    /// Returns the report map when the playbook ends `successful`.
    ///
    /// # Errors
    ///
    /// Configuration errors surface before anything is provisioned. A run
    /// that ends in any other state is a [`crate::TaskError::Report`]
    /// carrying the status and the full report.
    pub async fn execute(
        &self,
        task: &TaskConfig,
        context: &ExecutionContext,
        connections: &dyn ConnectionProvider,
        outputs: &mut dyn OutputChannel,
    ) -> Result<Value> {
        let connection = connections.connection(&task.conn_id)?;
        let config = resolve(task, context, &self.settings.default_vars, &connection)?;

        let (fp, canonical) = fingerprint::compute(&config.environment, self.settings.cache_key.as_deref());
        info!(
            "Task {} (run {}) uses environment {}",
            config.task_id, context.run_id, fp
        );

        let handle = self.acquire(fp, canonical, &config.environment).await?;
        let outcome = self.run_in(&handle, &config, &connection, outputs).await;
        self.release(handle).await;

        outcome
    }

    async fn acquire(
        &self,
        fp: fingerprint::Fingerprint,
        canonical: String,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle> {
        let provisioner = Arc::clone(&self.provisioner);
        let spec = spec.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let handle = provisioner.acquire(&fp, &canonical, spec.cache_path.as_deref(), &spec)?;
            provisioner.install_collections(&handle, &spec.collections)?;
            Ok::<_, convenient_venv::ProvisionError>(handle)
        })
        .await??;

        info!(
            "Environment {} ready at {} ({})",
            handle.fingerprint(),
            handle.path().display(),
            if handle.is_ephemeral() {
                "ephemeral"
            } else if handle.was_reused() {
                "cached"
            } else {
                "built"
            }
        );
        Ok(handle)
    }

    async fn run_in(
        &self,
        handle: &EnvironmentHandle,
        config: &ExecutionConfig,
        connection: &Connection,
        outputs: &mut dyn OutputChannel,
    ) -> Result<Value> {
        let mut events = EventAggregator::new(config.track_hosts);
        let result = self
            .runner
            .run(config, &handle.bin_dir(), connection, &mut events)
            .await?;

        Ok(finalize(&result, &events, outputs)?)
    }

    /// Release without letting a cleanup failure replace the run outcome
    async fn release(&self, handle: EnvironmentHandle) {
        let provisioner = Arc::clone(&self.provisioner);
        let path = handle.path().to_path_buf();

        match tokio::task::spawn_blocking(move || provisioner.release(handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to release environment at {}: {}", path.display(), e),
            Err(e) => warn!("Release of {} did not complete: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use convenient_ansible::{ConnectionStore, Deferrable, MemoryChannel};
    use std::path::Path;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    /// Removes the environment it was asked to build
    struct VanishingBuilder;

    impl EnvironmentBuilder for VanishingBuilder {
        fn create(&self, target: &Path, _spec: &EnvironmentSpec) -> convenient_venv::Result<()> {
            std::fs::remove_dir_all(target)?;
            Ok(())
        }

        fn install_requirements(&self, _target: &Path, _spec: &EnvironmentSpec) -> convenient_venv::Result<()> {
            Ok(())
        }

        fn install_collection(&self, _target: &Path, _collection: &str) -> convenient_venv::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_release_failure_does_not_replace_run_outcome() {
        let tmp = TempDir::new().unwrap();
        let connections = ConnectionStore::from_yaml_str(&format!(
            "ansible_default:\n  username: deploy\n  project_directory: {}\n  artifact_directory: {}\n",
            tmp.path().display(),
            tmp.path().join("artifacts").display()
        ))
        .unwrap();
        let task = TaskConfig {
            task_id: "deploy".to_string(),
            playbook: Some(Deferrable::Literal("site.yml".to_string())),
            ..TaskConfig::default()
        };

        let pipeline = TaskPipeline::with_provisioner(Settings::default(), Provisioner::with_builder(VanishingBuilder));
        let err = pipeline
            .execute(&task, &ExecutionContext::default(), &connections, &mut MemoryChannel::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Run(_)));
        assert!(logs_contain("uses environment"));
        assert!(logs_contain("Failed to release environment"));
    }
}
