//! Cache command: inspect and evict cached environments

use convenient_venv::{CacheManager, Fingerprint};
use playzel::Settings;
use std::path::Path;

/// List the environments under `cache_root`
pub fn info(cache_root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let query = CacheManager::new(cache_root).query()?;

    println!("📊 Environment cache: {}", query.cache_root.display());
    println!();

    if query.entries.is_empty() {
        println!("  (empty)");
        return Ok(());
    }

    for entry in &query.entries {
        let created = entry.created_at.map_or_else(
            || "-".to_string(),
            |t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string(),
        );
        println!(
            "  {}  {:>10}  {:<10}  {}",
            entry.fingerprint,
            format_size(entry.bytes),
            if entry.complete { "complete" } else { "incomplete" },
            created
        );
    }

    println!();
    println!(
        "  {} environments ({} complete), {}",
        query.entries.len(),
        query.complete_count(),
        format_size(query.total_bytes)
    );
    Ok(())
}

/// Remove one environment, or every incomplete one
pub fn evict(
    settings: &Settings,
    cache_root: &Path,
    fingerprint: Option<&str>,
    incomplete: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = CacheManager::new(cache_root);

    let stats = match fingerprint {
        Some(fp) if !incomplete => {
            if !Fingerprint::is_valid(fp) {
                return Err(format!("'{fp}' is not a fingerprint").into());
            }
            manager.evict(&Fingerprint::from_hex(fp), settings.lock_timeout())?
        }
        _ => manager.prune_incomplete()?,
    };

    println!(
        "🧹 Removed {} environments ({} files, {})",
        stats.environments,
        stats.files,
        format_size(stats.bytes)
    );
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
