//! Pure derivation of tenant-isolated build cache references (spec §4.B).
//!
//! Maps `(registry, tenant scope, runtime, lockfile hashes)` onto a stable
//! registry cache reference two strings: one for `--cache-from`, one for
//! `--cache-to`. No I/O, no external state — the same inputs always
//! produce the same outputs.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache scope {0:?} normalises to an invalid value (must be 3-64 chars of [a-z0-9-])")]
    InvalidScope(String),
}

impl CacheError {
    pub fn kind(&self) -> imgforge_core::ErrorKind {
        imgforge_core::ErrorKind::InvalidScope
    }
}

/// The registry arguments a builder passes to its layer cache importer and
/// exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRef {
    pub import_arg: String,
    pub export_arg: String,
}

/// Normalise a raw tenant scope string per spec: lowercase, collapse every
/// character outside `[a-z0-9-]` to `-`, collapse runs of `-`, trim leading
/// and trailing `-`.
fn normalise_scope(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            c
        } else {
            '-'
        };
        if mapped == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        collapsed.push(mapped);
    }
    collapsed.trim_matches('-').to_string()
}

/// Normalise and validate a tenant cache scope on its own — the half of
/// [`derive_cache_ref`]'s contract that doesn't need a registry URL,
/// runtime tag, or lockfile hashes. Used at the submission boundary, where
/// only the raw scope is known yet (spec §3 invariant, §7 `InvalidScope`).
///
/// Returns `Ok(None)` for an empty scope (caching disabled), `Ok(Some(_))`
/// with the normalised `[a-z0-9-]{3..64}` value, or `Err(InvalidScope)` if
/// normalisation collapses a non-empty scope out of that range.
pub fn normalise_and_validate_scope(raw_scope: &str) -> Result<Option<String>, CacheError> {
    if raw_scope.is_empty() {
        return Ok(None);
    }
    let scope = normalise_scope(raw_scope);
    if scope.len() < 3 || scope.len() > 64 {
        return Err(CacheError::InvalidScope(raw_scope.to_string()));
    }
    Ok(Some(scope))
}

/// First 16 hex chars of SHA-256 over the ascending-name-ordered
/// concatenation of `"{name}:{hex}\n"`. An empty or absent map hashes the
/// literal string `"empty"` instead — the digest is always a real 64-char
/// SHA-256 hex string, never a short literal, so the first-16 slice stays
/// well-formed either way.
fn lockfile_digest(lockfile_hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    if lockfile_hashes.is_empty() {
        hasher.update(b"empty");
    } else {
        // BTreeMap already iterates in ascending key order.
        for (name, hex) in lockfile_hashes {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(hex.as_bytes());
            hasher.update(b"\n");
        }
    }
    let digest = hasher.finalize();
    let full_hex = format!("{:x}", digest);
    debug_assert_eq!(full_hex.len(), 64);
    full_hex[..16].to_string()
}

/// Derive a cache reference pair. Returns `Ok(None)` when `tenant_scope` is
/// empty (caching disabled for this build), `Err(InvalidScope)` when a
/// non-empty scope normalises out of the `3..=64` character range, and
/// otherwise the import/export argument pair.
pub fn derive_cache_ref(
    registry_url: &str,
    tenant_scope: &str,
    runtime_tag: &str,
    lockfile_hashes: &BTreeMap<String, String>,
) -> Result<Option<CacheRef>, CacheError> {
    let Some(scope) = normalise_and_validate_scope(tenant_scope)? else {
        return Ok(None);
    };

    let h16 = lockfile_digest(lockfile_hashes);
    let reference = format!("{registry_url}/cache/{scope}/{runtime_tag}/{h16}");

    Ok(Some(CacheRef {
        import_arg: format!("type=registry,ref={reference}"),
        export_arg: format!("type=registry,ref={reference},mode=max"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockfiles(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_caching_disabled_for_empty_scope() {
        let result = derive_cache_ref("localhost:5000", "", "nodejs", &BTreeMap::new()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_scope_normalisation_and_prefix() {
        let hashes = lockfiles(&[("package-lock.json", "abc"), ("yarn.lock", "def")]);
        let result = derive_cache_ref("localhost:8080", "My Team!@#$%", "nodejs", &hashes)
            .unwrap()
            .unwrap();
        assert!(
            result
                .import_arg
                .contains("ref=localhost:8080/cache/my-team/nodejs/"),
            "got {}",
            result.import_arg
        );
        assert!(result.export_arg.ends_with(",mode=max"));
    }

    #[test]
    fn test_lockfile_map_order_does_not_affect_result() {
        let forward = lockfiles(&[("package-lock.json", "abc"), ("yarn.lock", "def")]);
        let reversed = lockfiles(&[("yarn.lock", "def"), ("package-lock.json", "abc")]);
        let a = derive_cache_ref("localhost:8080", "acme", "nodejs", &forward).unwrap();
        let b = derive_cache_ref("localhost:8080", "acme", "nodejs", &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_lockfiles_still_yield_64_hex_char_digest_source() {
        let result = derive_cache_ref("localhost:8080", "acme", "nodejs", &BTreeMap::new())
            .unwrap()
            .unwrap();
        // first-16 slice of a real SHA-256("empty"), not a short literal.
        assert!(result.import_arg.ends_with("/2e1cfa82b035c26c"));
    }

    #[test]
    fn test_invalid_scope_too_short() {
        let err = derive_cache_ref("localhost:8080", "a!", "nodejs", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), imgforge_core::ErrorKind::InvalidScope);
    }

    #[test]
    fn test_invalid_scope_normalises_to_empty() {
        let err = derive_cache_ref("localhost:8080", "!!!", "nodejs", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidScope(_)));
    }

    #[test]
    fn test_valid_scope_exactly_three_chars() {
        assert!(derive_cache_ref("localhost:8080", "abc", "nodejs", &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_scope_over_64_chars_rejected() {
        let long = "a".repeat(65);
        let err = derive_cache_ref("localhost:8080", &long, "nodejs", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidScope(_)));
    }

    #[test]
    fn test_normalise_and_validate_scope_empty_is_none() {
        assert_eq!(normalise_and_validate_scope("").unwrap(), None);
    }

    #[test]
    fn test_normalise_and_validate_scope_matches_derive_cache_ref() {
        let normalised = normalise_and_validate_scope("My Team!@#$%").unwrap().unwrap();
        assert_eq!(normalised, "my-team");
        let result = derive_cache_ref("localhost:8080", "My Team!@#$%", "nodejs", &BTreeMap::new())
            .unwrap()
            .unwrap();
        assert!(result.import_arg.contains(&format!("/cache/{normalised}/")));
    }

    #[test]
    fn test_normalise_and_validate_scope_rejects_too_short() {
        let err = normalise_and_validate_scope("a!").unwrap_err();
        assert_eq!(err.kind(), imgforge_core::ErrorKind::InvalidScope);
    }
}
