//! Cross-process build locks and atomic file commits

use crate::{ProvisionError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

/// Exclusive advisory lock, released when dropped
pub type BuildLock = Flock<File>;

/// Take an exclusive `flock` on `path`, polling until `timeout` elapses
///
/// The lock lives on an open file description, so it serializes other
/// processes sharing the cache root as well as other threads of this one.
pub fn acquire_lock(path: &Path, timeout: Duration, poll: Duration) -> Result<BuildLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    let start = Instant::now();
    let mut logged = false;

    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => return Ok(lock),
            Err((returned, Errno::EAGAIN)) => {
                file = returned;
                if start.elapsed() >= timeout {
                    return Err(ProvisionError::LockTimeout {
                        path: path.to_path_buf(),
                        waited_secs: start.elapsed().as_secs(),
                    });
                }
                if !logged {
                    tracing::info!("Waiting for build lock {}", path.display());
                    logged = true;
                }
                std::thread::sleep(poll);
            }
            Err((_, errno)) => {
                return Err(ProvisionError::Lock {
                    path: path.to_path_buf(),
                    reason: errno.to_string(),
                });
            }
        }
    }
}

/// Write data to a file atomically with fsync for durability
///
/// Write to a temporary sibling, fsync it, rename over the destination, then
/// fsync the parent directory so the new entry survives a crash.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;

    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        // Best effort, not every filesystem supports syncing directories
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("abcd1234.lock");

        let held = acquire_lock(&path, Duration::from_secs(1), Duration::from_millis(10)).unwrap();
        let second = acquire_lock(&path, Duration::from_millis(100), Duration::from_millis(10));
        assert!(matches!(second, Err(ProvisionError::LockTimeout { .. })));

        drop(held);
        assert!(acquire_lock(&path, Duration::from_millis(100), Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("marker.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }
}
