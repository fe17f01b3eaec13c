//! Cache-aware environment provisioning
//!
//! Cached environments live at `cache_root/<fingerprint>`. A directory only
//! counts as reusable once [`COMPLETE_MARKER`] has been committed into it,
//! which happens after every build step succeeded. Builds for one fingerprint
//! are serialized by an exclusive lock on `cache_root/<fingerprint>.lock`.
//!
//! Ephemeral environments are built into a fresh `venv-*` temporary
//! directory and removed by [`Provisioner::release`], or when the handle is
//! dropped on an early exit.

use crate::builder::{EnvironmentBuilder, VenvBuilder};
use crate::fingerprint::Fingerprint;
use crate::lock;
use crate::spec::EnvironmentSpec;
use crate::{ProvisionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Marker file committed into a cached environment after a successful build
pub const COMPLETE_MARKER: &str = "install_complete_marker.json";

/// Default bound on how long an acquirer waits for a concurrent build
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of [`COMPLETE_MARKER`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Fingerprint the environment was built for
    pub fingerprint: String,
    /// Canonical inputs the fingerprint was derived from
    pub canonical_form: String,
    /// When the build was committed
    pub created_at: DateTime<Utc>,
}

impl CompletionMarker {
    /// Read the marker of the environment at `env_dir`, if it exists and parses
    pub fn read(env_dir: &Path) -> Option<Self> {
        let path = env_dir.join(COMPLETE_MARKER);
        let content = fs::read(&path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable marker {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Path of the lock file guarding builds of `fingerprint` under `cache_root`
#[must_use]
pub fn lock_path(cache_root: &Path, fingerprint: &Fingerprint) -> PathBuf {
    cache_root.join(format!("{fingerprint}.lock"))
}

/// An acquired environment
#[derive(Debug)]
pub enum EnvironmentHandle {
    /// Persistent environment under the cache root
    Cached {
        /// `cache_root/<fingerprint>`
        path: PathBuf,
        /// Fingerprint of the environment
        fingerprint: Fingerprint,
        /// Whether an existing build was reused
        reused: bool,
    },

    /// Temporary environment owned by one task execution
    Ephemeral {
        /// Directory removed on release or drop
        dir: TempDir,
        /// Fingerprint of the environment
        fingerprint: Fingerprint,
    },
}

impl EnvironmentHandle {
    /// Root directory of the environment
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Cached { path, .. } => path,
            Self::Ephemeral { dir, .. } => dir.path(),
        }
    }

    /// Directory holding the environment's executables
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.path().join("bin")
    }

    /// Fingerprint the environment was provisioned for
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Cached { fingerprint, .. } | Self::Ephemeral { fingerprint, .. } => fingerprint,
        }
    }

    /// Whether the environment is removed on release
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral { .. })
    }

    /// Whether a previously built environment was reused
    #[must_use]
    pub fn was_reused(&self) -> bool {
        matches!(self, Self::Cached { reused: true, .. })
    }
}

/// Acquires and releases execution environments
pub struct Provisioner<B: EnvironmentBuilder = VenvBuilder> {
    builder: B,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl Provisioner<VenvBuilder> {
    /// Provisioner building real Python virtual environments
    #[must_use]
    pub fn new() -> Self {
        Self::with_builder(VenvBuilder::new())
    }
}

impl Default for Provisioner<VenvBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: EnvironmentBuilder> Provisioner<B> {
    /// Provisioner using a custom builder
    pub fn with_builder(builder: B) -> Self {
        Self {
            builder,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    /// Bound the wait for a concurrent build of the same fingerprint
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The underlying builder
    pub fn builder(&self) -> &B {
        &self.builder
    }

    /// Acquire an environment for `fingerprint`
    ///
    /// With a `cache_root` the environment at `cache_root/<fingerprint>` is
    /// reused when complete and built otherwise. Without one, a fresh
    /// ephemeral environment is always built.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionError`] when the build fails, the build lock
    /// cannot be taken in time, or a complete environment under the same
    /// fingerprint was built from different inputs.
    pub fn acquire(
        &self,
        fingerprint: &Fingerprint,
        canonical_form: &str,
        cache_root: Option<&Path>,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle> {
        match cache_root {
            Some(root) => self.acquire_cached(fingerprint, canonical_form, root, spec),
            None => self.acquire_ephemeral(fingerprint, spec),
        }
    }

    fn acquire_cached(
        &self,
        fingerprint: &Fingerprint,
        canonical_form: &str,
        cache_root: &Path,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle> {
        let target = cache_root.join(fingerprint.as_str());

        if is_complete(&target, fingerprint, canonical_form)? {
            info!("Cache HIT for environment {} at {}", fingerprint, target.display());
            return Ok(EnvironmentHandle::Cached {
                path: target,
                fingerprint: fingerprint.clone(),
                reused: true,
            });
        }

        let _lock = lock::acquire_lock(
            &lock_path(cache_root, fingerprint),
            self.lock_timeout,
            self.poll_interval,
        )?;

        // Another acquirer may have finished the build while we waited
        if is_complete(&target, fingerprint, canonical_form)? {
            info!("Environment {} was built by a concurrent acquirer", fingerprint);
            return Ok(EnvironmentHandle::Cached {
                path: target,
                fingerprint: fingerprint.clone(),
                reused: true,
            });
        }

        if target.exists() {
            warn!("Removing incomplete environment at {}", target.display());
            fs::remove_dir_all(&target)?;
        }

        info!("Cache MISS for environment {}, building at {}", fingerprint, target.display());
        fs::create_dir_all(&target)?;

        if let Err(e) = self.build(&target, spec) {
            if let Err(cleanup) = fs::remove_dir_all(&target) {
                warn!("Failed to remove failed build at {}: {}", target.display(), cleanup);
            }
            return Err(e);
        }

        let marker = CompletionMarker {
            fingerprint: fingerprint.to_string(),
            canonical_form: canonical_form.to_string(),
            created_at: Utc::now(),
        };
        lock::atomic_write(&target.join(COMPLETE_MARKER), &serde_json::to_vec_pretty(&marker)?)?;
        info!("Committed environment {}", fingerprint);

        Ok(EnvironmentHandle::Cached {
            path: target,
            fingerprint: fingerprint.clone(),
            reused: false,
        })
    }

    fn acquire_ephemeral(&self, fingerprint: &Fingerprint, spec: &EnvironmentSpec) -> Result<EnvironmentHandle> {
        let dir = tempfile::Builder::new().prefix("venv-").tempdir()?;
        info!("Building ephemeral environment {} at {}", fingerprint, dir.path().display());

        // On failure `dir` is dropped here, which removes it
        self.build(dir.path(), spec)?;

        Ok(EnvironmentHandle::Ephemeral {
            dir,
            fingerprint: fingerprint.clone(),
        })
    }

    fn build(&self, target: &Path, spec: &EnvironmentSpec) -> Result<()> {
        self.builder.create(target, spec)?;
        self.builder.install_requirements(target, spec)
    }

    /// Install collections into an acquired environment
    ///
    /// Runs on every acquisition, cache hits included. Collections are not
    /// part of the build and nothing records that they were installed.
    ///
    /// # Errors
    ///
    /// Stops at the first failing collection.
    pub fn install_collections(&self, handle: &EnvironmentHandle, collections: &[String]) -> Result<()> {
        for collection in collections {
            self.builder.install_collection(handle.path(), collection)?;
        }
        Ok(())
    }

    /// Release an environment
    ///
    /// Cached environments stay on disk. Ephemeral environments are deleted.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if an ephemeral directory could not be removed.
    pub fn release(&self, handle: EnvironmentHandle) -> Result<()> {
        match handle {
            EnvironmentHandle::Cached { path, .. } => {
                debug!("Keeping cached environment {}", path.display());
                Ok(())
            }
            EnvironmentHandle::Ephemeral { dir, fingerprint } => {
                info!("Removing ephemeral environment {} at {}", fingerprint, dir.path().display());
                dir.close().map_err(ProvisionError::from)
            }
        }
    }
}

/// Whether `target` holds a committed build of `canonical_form`
fn is_complete(target: &Path, fingerprint: &Fingerprint, canonical_form: &str) -> Result<bool> {
    let Some(marker) = CompletionMarker::read(target) else {
        return Ok(false);
    };

    if marker.canonical_form != canonical_form {
        return Err(ProvisionError::FingerprintCollision {
            fingerprint: fingerprint.to_string(),
        });
    }

    Ok(true)
}
