//! Cached Python virtual environments for playbook execution
//!
//! This crate provisions the execution environment a playbook run needs:
//!
//! - **Fingerprinting**: a short SHA-256 prefix over the canonical form of the
//!   inputs that define an environment (requirements, install options, index
//!   URLs, cache key, python version, system site packages, collections)
//! - **Provisioning**: reuse of `cache_root/<fingerprint>` when a complete
//!   environment exists, otherwise a build serialized by an advisory file lock
//!   and committed with a marker file
//! - **Ephemeral environments**: temporary directories removed on release
//! - **Cache management**: listing and explicit eviction of cached environments
//!
//! ## Example
//!
//! ```no_run
//! use convenient_venv::{EnvironmentSpec, Provisioner, fingerprint};
//! use std::path::Path;
//!
//! # fn example() -> convenient_venv::Result<()> {
//! let spec = EnvironmentSpec {
//!     requirements: vec!["ansible-core".to_string(), "ansible-runner".to_string()],
//!     ..EnvironmentSpec::default()
//! };
//! let (fp, canonical) = fingerprint::compute(&spec, None);
//!
//! let provisioner = Provisioner::new();
//! let handle = provisioner.acquire(&fp, &canonical, Some(Path::new("/tmp/venv_cache")), &spec)?;
//! provisioner.install_collections(&handle, &spec.collections)?;
//! println!("ansible-runner lives in {}", handle.bin_dir().display());
//! provisioner.release(handle)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod builder;
pub mod cache_manager;
pub mod canonical;
pub mod fingerprint;
pub mod lock;
pub mod provisioner;
pub mod spec;

pub use builder::{EnvironmentBuilder, VenvBuilder};
pub use cache_manager::{CacheManager, CacheQuery, CachedEnvironment, EvictStats};
pub use fingerprint::Fingerprint;
pub use provisioner::{EnvironmentHandle, Provisioner, COMPLETE_MARKER};
pub use spec::EnvironmentSpec;

use std::path::PathBuf;

/// Errors raised while provisioning or managing environments
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The virtual environment could not be created
    #[error("Failed to create virtual environment at {path}: {reason}")]
    VenvCreation {
        /// Target directory
        path: PathBuf,
        /// Captured stderr or spawn error
        reason: String,
    },

    /// Requirement installation failed
    #[error("Failed to install requirements into {path}: {reason}")]
    Install {
        /// Environment directory
        path: PathBuf,
        /// Captured stderr or spawn error
        reason: String,
    },

    /// A post-build collection installation failed
    #[error("Failed to install collection {collection}: {reason}")]
    CollectionInstall {
        /// Collection name as requested
        collection: String,
        /// Captured stderr or spawn error
        reason: String,
    },

    /// Another acquirer held the build lock for longer than allowed
    #[error("Timed out after {waited_secs}s waiting for lock {path}")]
    LockTimeout {
        /// Lock file path
        path: PathBuf,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// The lock could not be taken for a reason other than contention
    #[error("Failed to acquire lock {path}: {reason}")]
    Lock {
        /// Lock file path
        path: PathBuf,
        /// Underlying errno
        reason: String,
    },

    /// A complete environment exists under our fingerprint but was built from other inputs
    #[error("Fingerprint {fingerprint} collides with an environment built from different inputs")]
    FingerprintCollision {
        /// The colliding fingerprint
        fingerprint: String,
    },

    /// Marker file could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
