//! Stable content-derived identifiers.
//!
//! POIs and candidates are keyed by hashes, not memory references, so ids
//! are portable across processes and identical across re-runs on the same
//! input. Parts are separator-delimited before hashing so that adjacent
//! fields cannot collide by concatenation.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

macro_rules! define_hash_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_hash(hash: String) -> Self {
                Self(hash)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_hash_id!(PoiId);
define_hash_id!(CandidateId);

/// Stable id for a POI.
///
/// Components: file_path, name, type, start_line, end_line.
pub fn poi_id(file_path: &str, name: &str, poi_type: &str, start_line: u32, end_line: u32) -> PoiId {
    PoiId(hash_parts(&[
        file_path,
        name,
        poi_type,
        &start_line.to_string(),
        &end_line.to_string(),
    ]))
}

/// Stable id for a relationship candidate.
///
/// Components: source POI id, symbolic target name, relationship type,
/// owning file path. Deliberately excludes the resolved target id so that
/// late resolution does not change the candidate's identity.
pub fn candidate_id(
    source_poi_id: &PoiId,
    target_name: &str,
    rel_type: &str,
    file_path: &str,
) -> CandidateId {
    CandidateId(hash_parts(&[
        source_poi_id.as_str(),
        target_name,
        rel_type,
        file_path,
    ]))
}

/// Content hash of a file's bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poi_id_is_stable() {
        let a = poi_id("src/lib.rs", "connect", "function", 10, 42);
        let b = poi_id("src/lib.rs", "connect", "function", 10, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn test_poi_id_sensitive_to_span() {
        let a = poi_id("src/lib.rs", "connect", "function", 10, 42);
        let b = poi_id("src/lib.rs", "connect", "function", 10, 43);
        assert_ne!(a, b);
    }

    #[test]
    fn test_separator_prevents_concatenation_collisions() {
        let a = poi_id("a/b", "cd", "function", 1, 1);
        let b = poi_id("a/bc", "d", "function", 1, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_candidate_id_ignores_resolution() {
        let source = poi_id("src/lib.rs", "connect", "function", 10, 42);
        let a = candidate_id(&source, "Pool::new", "CALLS", "src/lib.rs");
        let b = candidate_id(&source, "Pool::new", "CALLS", "src/lib.rs");
        assert_eq!(a, b);
    }
}
