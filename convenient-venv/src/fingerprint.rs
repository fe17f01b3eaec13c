//! Environment fingerprints
//!
//! A fingerprint is the first 8 hex characters of the SHA-256 digest of the
//! canonical JSON form of the environment-defining inputs. The canonical form
//! is returned alongside so that the cache can record exactly what a
//! directory was built from.

use crate::canonical::to_canonical_json;
use crate::spec::EnvironmentSpec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept from the digest
pub const FINGERPRINT_LEN: usize = 8;

/// Short digest identifying an environment's defining inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing fingerprint string (e.g. a cache directory name)
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Fingerprint as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `name` has the shape of a fingerprint
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        name.len() == FINGERPRINT_LEN && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form of the environment-defining inputs
///
/// `cache_key` is the operator-controlled override; an absent key hashes the
/// same as an empty one.
#[must_use]
pub fn canonical_form(spec: &EnvironmentSpec, cache_key: Option<&str>) -> String {
    let inputs = json!({
        "requirements_list": spec.requirements_list(),
        "pip_install_options": spec.pip_install_options,
        "index_urls": spec.index_urls,
        "cache_key": cache_key.unwrap_or(""),
        "python_version": spec.python_version,
        "system_site_packages": spec.system_site_packages,
        "galaxy_collections": spec.collections,
    });
    to_canonical_json(&inputs)
}

/// Compute the fingerprint and the canonical form it was derived from
#[must_use]
pub fn compute(spec: &EnvironmentSpec, cache_key: Option<&str>) -> (Fingerprint, String) {
    let canonical = canonical_form(spec, cache_key);
    (digest(&canonical), canonical)
}

/// Fingerprint of an already canonical string
#[must_use]
pub fn digest(canonical: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hex = hex::encode(hasher.finalize());
    Fingerprint(hex[..FINGERPRINT_LEN].to_string())
}
