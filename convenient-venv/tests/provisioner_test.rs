//! Provisioner behavior against a builder that only touches the filesystem

use convenient_venv::fingerprint::{self, Fingerprint};
use convenient_venv::lock;
use convenient_venv::provisioner::lock_path;
use convenient_venv::{
    COMPLETE_MARKER, EnvironmentBuilder, EnvironmentSpec, ProvisionError, Provisioner,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default, Clone)]
struct FakeBuilder {
    creates: Arc<AtomicUsize>,
    installs: Arc<AtomicUsize>,
    collections: Arc<Mutex<Vec<String>>>,
    fail_install: Arc<AtomicBool>,
    install_delay: Duration,
}

impl EnvironmentBuilder for FakeBuilder {
    fn create(&self, target: &Path, _spec: &EnvironmentSpec) -> convenient_venv::Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(target.join("bin"))?;
        fs::write(target.join("bin").join("python"), b"#!/bin/sh\n")?;
        Ok(())
    }

    fn install_requirements(&self, target: &Path, spec: &EnvironmentSpec) -> convenient_venv::Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.install_delay);
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(ProvisionError::Install {
                path: target.to_path_buf(),
                reason: "No matching distribution found for pkgA==1.0".to_string(),
            });
        }
        fs::write(target.join("requirements.txt"), spec.requirements_list().join("\n"))?;
        Ok(())
    }

    fn install_collection(&self, _target: &Path, collection: &str) -> convenient_venv::Result<()> {
        self.collections.lock().unwrap().push(collection.to_string());
        Ok(())
    }
}

fn spec() -> EnvironmentSpec {
    EnvironmentSpec {
        requirements: vec!["pkgA==1.0".to_string()],
        system_site_packages: false,
        ..EnvironmentSpec::default()
    }
}

#[test]
fn test_second_acquire_reuses_cached_environment() {
    let cache = TempDir::new().unwrap();
    let builder = FakeBuilder::default();
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let first = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();
    assert!(!first.was_reused());
    assert_eq!(first.path(), cache.path().join(fp.as_str()));
    assert!(first.path().join(COMPLETE_MARKER).exists());
    provisioner.release(first).unwrap();

    let second = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();
    assert!(second.was_reused());
    assert!(second.path().exists());
    provisioner.release(second).unwrap();

    assert_eq!(builder.installs.load(Ordering::SeqCst), 1);
    assert!(cache.path().join(fp.as_str()).exists());
}

#[test]
fn test_failed_build_is_not_reused() {
    let cache = TempDir::new().unwrap();
    let builder = FakeBuilder::default();
    builder.fail_install.store(true, Ordering::SeqCst);
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let err = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap_err();
    assert!(matches!(err, ProvisionError::Install { .. }));
    assert!(!cache.path().join(fp.as_str()).join(COMPLETE_MARKER).exists());
    assert!(!cache.path().join(fp.as_str()).exists());

    builder.fail_install.store(false, Ordering::SeqCst);
    let handle = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();
    assert!(!handle.was_reused());
    assert_eq!(builder.installs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_partial_directory_is_rebuilt() {
    let cache = TempDir::new().unwrap();
    let builder = FakeBuilder::default();
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    // Leftover from an interrupted build: files but no marker
    let partial = cache.path().join(fp.as_str());
    fs::create_dir_all(partial.join("lib")).unwrap();
    fs::write(partial.join("lib").join("half-written.py"), b"").unwrap();

    let handle = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();

    assert!(!handle.was_reused());
    assert!(!partial.join("lib").join("half-written.py").exists());
    assert!(partial.join(COMPLETE_MARKER).exists());
    assert_eq!(builder.creates.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_acquirers_build_once() {
    let cache = TempDir::new().unwrap();
    let builder = FakeBuilder {
        install_delay: Duration::from_millis(300),
        ..FakeBuilder::default()
    };
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let paths: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    provisioner
                        .acquire(&fp, &canonical, Some(cache.path()), &spec)
                        .unwrap()
                        .path()
                        .to_path_buf()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(paths[0], paths[1]);
    assert_eq!(builder.installs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lock_timeout_while_build_in_progress() {
    let cache = TempDir::new().unwrap();
    let provisioner = Provisioner::with_builder(FakeBuilder::default()).with_lock_timeout(Duration::from_millis(200));
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let _held = lock::acquire_lock(&lock_path(cache.path(), &fp), Duration::from_secs(1), Duration::from_millis(10))
        .unwrap();

    let err = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap_err();
    assert!(matches!(err, ProvisionError::LockTimeout { .. }));
}

#[test]
fn test_collision_is_detected() {
    let cache = TempDir::new().unwrap();
    let provisioner = Provisioner::with_builder(FakeBuilder::default());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();

    let err = provisioner
        .acquire(&fp, "{\"something\":\"else\"}", Some(cache.path()), &spec)
        .unwrap_err();
    assert!(matches!(err, ProvisionError::FingerprintCollision { .. }));
}

#[test]
fn test_ephemeral_environment_is_removed_on_release() {
    let builder = FakeBuilder::default();
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let handle = provisioner.acquire(&fp, &canonical, None, &spec).unwrap();
    let path = handle.path().to_path_buf();

    assert!(handle.is_ephemeral());
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("venv-"));
    assert!(path.join("bin").join("python").exists());

    provisioner.release(handle).unwrap();
    assert!(!path.exists());
}

#[test]
fn test_ephemeral_environment_is_removed_on_drop() {
    let provisioner = Provisioner::with_builder(FakeBuilder::default());
    let spec = spec();
    let (fp, canonical) = fingerprint::compute(&spec, None);

    let handle = provisioner.acquire(&fp, &canonical, None, &spec).unwrap();
    let path = handle.path().to_path_buf();
    drop(handle);

    assert!(!path.exists());
}

#[test]
fn test_collections_installed_on_every_acquisition() {
    let cache = TempDir::new().unwrap();
    let builder = FakeBuilder::default();
    let provisioner = Provisioner::with_builder(builder.clone());
    let spec = EnvironmentSpec {
        collections: vec!["community.docker".to_string()],
        ..spec()
    };
    let (fp, canonical) = fingerprint::compute(&spec, None);

    for _ in 0..2 {
        let handle = provisioner.acquire(&fp, &canonical, Some(cache.path()), &spec).unwrap();
        provisioner.install_collections(&handle, &spec.collections).unwrap();
        provisioner.release(handle).unwrap();
    }

    assert_eq!(builder.installs.load(Ordering::SeqCst), 1);
    assert_eq!(
        *builder.collections.lock().unwrap(),
        vec!["community.docker".to_string(), "community.docker".to_string()]
    );
}

#[test]
fn test_distinct_fingerprints_get_distinct_directories() {
    let cache = TempDir::new().unwrap();
    let provisioner = Provisioner::with_builder(FakeBuilder::default());

    let a = spec();
    let b = EnvironmentSpec {
        requirements: vec!["pkgB==2.0".to_string()],
        ..spec()
    };
    let (fa, ca) = fingerprint::compute(&a, None);
    let (fb, cb) = fingerprint::compute(&b, None);

    let ha = provisioner.acquire(&fa, &ca, Some(cache.path()), &a).unwrap();
    let hb = provisioner.acquire(&fb, &cb, Some(cache.path()), &b).unwrap();

    assert_ne!(ha.path(), hb.path());
    assert_eq!(ha.fingerprint(), &fa);
    assert_eq!(hb.fingerprint(), &Fingerprint::from_hex(fb.as_str()));
}
