//! Content checksums for rule updates.
//!
//! The checksum covers the canonical JSON form of the [`RuleSet`]: object keys
//! sorted, no insignificant whitespace. Declared checksums are either
//! `sha256:<hex>` or bare 64-character SHA-256 hex.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use edgesync_common::types::DEFAULT_CHECKSUM;
use edgesync_common::{Result, RuleSet, RuleVersion};

const SHA256_PREFIX: &str = "sha256:";

/// Result of checking a payload against its declared checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumCheck {
    /// Computed hash matches the declared one.
    Verified,
    /// Hashes differ: the payload is truncated, corrupted or tampered with.
    Mismatch { declared: String, computed: String },
    /// The declared checksum cannot be checked at all.
    Unavailable(String),
}

/// Canonical serialization of a rule set.
///
/// Keys are sorted at every level, so the bytes do not depend on field order
/// on the wire or on how `serde_json` maps are ordered.
pub fn canonical_payload(rules: &RuleSet) -> Result<String> {
    let value = canonicalize(serde_json::to_value(rules)?);
    Ok(serde_json::to_string(&value)?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Compute the checksum of a rule set in `sha256:<hex>` form.
pub fn compute(rules: &RuleSet) -> Result<String> {
    let payload = canonical_payload(rules)?;
    let digest = Sha256::digest(payload.as_bytes());
    Ok(format!("{}{}", SHA256_PREFIX, hex::encode(digest)))
}

/// Verify a rule set against the checksum declared in its version.
pub fn verify(version: &RuleVersion, rules: &RuleSet) -> ChecksumCheck {
    let declared = match declared_sha256(&version.checksum) {
        Ok(hex) => hex,
        Err(reason) => return ChecksumCheck::Unavailable(reason),
    };

    let computed = match compute(rules) {
        Ok(checksum) => checksum,
        Err(e) => return ChecksumCheck::Unavailable(format!("cannot canonicalize rules: {}", e)),
    };

    if computed[SHA256_PREFIX.len()..] == declared {
        ChecksumCheck::Verified
    } else {
        ChecksumCheck::Mismatch {
            declared: version.checksum.clone(),
            computed,
        }
    }
}

/// Extract the lowercase hex digest from a declared checksum.
fn declared_sha256(checksum: &str) -> std::result::Result<String, String> {
    if checksum == DEFAULT_CHECKSUM {
        return Err("placeholder checksum".to_string());
    }

    let hex_part = match checksum.split_once(':') {
        Some((algorithm, digest)) if algorithm.eq_ignore_ascii_case("sha256") => digest,
        Some((algorithm, _)) => {
            return Err(format!("unsupported checksum algorithm '{}'", algorithm))
        }
        None => checksum,
    };

    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(hex_part.to_ascii_lowercase())
    } else {
        Err(format!("unrecognized checksum format '{}'", checksum))
    }
}
