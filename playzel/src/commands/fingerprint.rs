//! Fingerprint command: show which environment a task would use

use convenient_venv::fingerprint;
use playzel::{Settings, TaskConfig};
use std::path::Path;

/// Print the fingerprint, canonical form and environment location of a task
pub fn execute(settings: &Settings, task_file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let task = TaskConfig::load(task_file)?;
    let spec = &task.environment;
    let (fp, canonical) = fingerprint::compute(spec, settings.cache_key.as_deref());

    println!("Fingerprint:    {fp}");
    println!("Canonical form: {canonical}");
    match &spec.cache_path {
        Some(root) => println!("Environment:    {}", root.join(fp.as_str()).display()),
        None => println!("Environment:    ephemeral"),
    }
    if !spec.collections.is_empty() {
        println!("Collections:    {} (installed on every run)", spec.collections.join(", "));
    }

    Ok(())
}
