//! Cache management for provisioned environments
//!
//! Inspects and evicts entries under a cache root. Eviction takes the same
//! per-fingerprint lock the provisioner builds under, so an environment is
//! never removed while it is being built.

use crate::fingerprint::Fingerprint;
use crate::lock;
use crate::provisioner::{CompletionMarker, lock_path};
use crate::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const EVICT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cache management operations
pub struct CacheManager {
    cache_root: PathBuf,
}

/// One environment directory found under the cache root
#[derive(Debug, Clone)]
pub struct CachedEnvironment {
    /// Directory name, the environment's fingerprint
    pub fingerprint: Fingerprint,
    /// Absolute location of the environment
    pub path: PathBuf,
    /// Whether the completion marker is present
    pub complete: bool,
    /// Total size of regular files in the environment
    pub bytes: u64,
    /// Commit time recorded in the marker
    pub created_at: Option<DateTime<Utc>>,
}

/// Summary of a cache root
#[derive(Debug, Default)]
pub struct CacheQuery {
    /// Root that was inspected
    pub cache_root: PathBuf,
    /// Environments, ordered by fingerprint
    pub entries: Vec<CachedEnvironment>,
    /// Sum of `bytes` over all entries
    pub total_bytes: u64,
}

impl CacheQuery {
    /// Number of entries carrying a completion marker
    #[must_use]
    pub fn complete_count(&self) -> usize {
        self.entries.iter().filter(|e| e.complete).count()
    }
}

/// Result of an eviction
#[derive(Debug, Default)]
pub struct EvictStats {
    /// Environments removed
    pub environments: usize,
    /// Files removed
    pub files: usize,
    /// Bytes freed
    pub bytes: u64,
}

impl CacheManager {
    /// Create a cache manager for a given cache root
    pub fn new(cache_root: impl AsRef<Path>) -> Self {
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
        }
    }

    /// List the environments under the cache root
    ///
    /// Only directories named like a fingerprint are reported. Lock files and
    /// anything else sharing the root are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the cache root exists but cannot be read.
    pub fn query(&self) -> Result<CacheQuery> {
        let mut query = CacheQuery {
            cache_root: self.cache_root.clone(),
            ..Default::default()
        };

        if !self.cache_root.exists() {
            return Ok(query);
        }

        for entry in std::fs::read_dir(&self.cache_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !Fingerprint::is_valid(&name) {
                continue;
            }

            let path = entry.path();
            let marker = CompletionMarker::read(&path);
            let bytes = dir_size(&path);
            query.total_bytes += bytes;
            query.entries.push(CachedEnvironment {
                fingerprint: Fingerprint::from_hex(name),
                complete: marker.is_some(),
                created_at: marker.map(|m| m.created_at),
                bytes,
                path,
            });
        }

        query.entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(query)
    }

    /// Remove one environment, waiting up to `lock_timeout` for its build lock
    ///
    /// # Errors
    ///
    /// Fails if the lock cannot be taken in time or removal fails.
    pub fn evict(&self, fingerprint: &Fingerprint, lock_timeout: Duration) -> Result<EvictStats> {
        let mut stats = EvictStats::default();
        let target = self.cache_root.join(fingerprint.as_str());

        let _lock = lock::acquire_lock(
            &lock_path(&self.cache_root, fingerprint),
            lock_timeout,
            EVICT_POLL_INTERVAL,
        )?;

        if target.exists() {
            stats.files = count_files(&target);
            stats.bytes = dir_size(&target);
            std::fs::remove_dir_all(&target)?;
            stats.environments = 1;
            info!("Evicted environment {} ({} bytes)", fingerprint, stats.bytes);
        } else {
            warn!("No cached environment {} under {}", fingerprint, self.cache_root.display());
        }

        Ok(stats)
    }

    /// Remove every environment that has no completion marker
    ///
    /// Directories whose lock is currently held belong to an in-progress build
    /// and are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the cache root cannot be listed or a removal fails.
    pub fn prune_incomplete(&self) -> Result<EvictStats> {
        let mut stats = EvictStats::default();

        for entry in self.query()?.entries.into_iter().filter(|e| !e.complete) {
            match self.evict(&entry.fingerprint, Duration::ZERO) {
                Ok(evicted) => {
                    stats.environments += evicted.environments;
                    stats.files += evicted.files;
                    stats.bytes += evicted.bytes;
                }
                Err(crate::ProvisionError::LockTimeout { .. }) => {
                    info!("Skipping {}, a build is in progress", entry.fingerprint);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(stats)
    }
}

// Helper functions

fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .count()
}

fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::COMPLETE_MARKER;
    use std::fs;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn write_env(root: &Path, name: &str, complete: bool) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/python"), b"#!/bin/sh\n").unwrap();
        if complete {
            let marker = CompletionMarker {
                fingerprint: name.to_string(),
                canonical_form: "{}".to_string(),
                created_at: Utc::now(),
            };
            fs::write(dir.join(COMPLETE_MARKER), serde_json::to_vec(&marker).unwrap()).unwrap();
        }
    }

    #[test]
    fn test_query_missing_root() {
        let tmp = TempDir::new().unwrap();
        let query = CacheManager::new(tmp.path().join("absent")).query().unwrap();
        assert!(query.entries.is_empty());
        assert_eq!(query.total_bytes, 0);
    }

    #[test]
    fn test_query_reports_entries() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), "bbbb2222", false);
        write_env(tmp.path(), "aaaa1111", true);
        fs::write(tmp.path().join("aaaa1111.lock"), b"").unwrap();
        fs::create_dir_all(tmp.path().join("not-a-venv")).unwrap();

        let query = CacheManager::new(tmp.path()).query().unwrap();

        assert_eq!(query.entries.len(), 2);
        assert_eq!(query.entries[0].fingerprint.as_str(), "aaaa1111");
        assert!(query.entries[0].complete);
        assert!(query.entries[0].created_at.is_some());
        assert!(!query.entries[1].complete);
        assert_eq!(query.complete_count(), 1);
        assert!(query.total_bytes > 0);
    }

    #[test]
    #[traced_test]
    fn test_evict() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), "aaaa1111", true);

        let manager = CacheManager::new(tmp.path());
        let stats = manager
            .evict(&Fingerprint::from_hex("aaaa1111"), Duration::from_secs(1))
            .unwrap();

        assert_eq!(stats.environments, 1);
        assert_eq!(stats.files, 2);
        assert!(!tmp.path().join("aaaa1111").exists());
        assert!(logs_contain("Evicted environment aaaa1111"));
    }

    #[test]
    fn test_evict_waits_for_build_lock() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), "aaaa1111", true);
        let fp = Fingerprint::from_hex("aaaa1111");

        let held = lock::acquire_lock(&lock_path(tmp.path(), &fp), Duration::from_secs(1), EVICT_POLL_INTERVAL)
            .unwrap();

        let manager = CacheManager::new(tmp.path());
        let result = manager.evict(&fp, Duration::from_millis(200));
        assert!(matches!(result, Err(crate::ProvisionError::LockTimeout { .. })));
        assert!(tmp.path().join("aaaa1111").exists());

        drop(held);
        assert_eq!(manager.evict(&fp, Duration::from_secs(1)).unwrap().environments, 1);
    }

    #[test]
    fn test_prune_incomplete_keeps_complete() {
        let tmp = TempDir::new().unwrap();
        write_env(tmp.path(), "aaaa1111", true);
        write_env(tmp.path(), "bbbb2222", false);

        let stats = CacheManager::new(tmp.path()).prune_incomplete().unwrap();

        assert_eq!(stats.environments, 1);
        assert!(tmp.path().join("aaaa1111").exists());
        assert!(!tmp.path().join("bbbb2222").exists());
    }
}
