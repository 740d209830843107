//! The curated harness mapping file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-harness declaration in the mapping file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessMapping {
    /// Container image reference for this harness.
    pub container: String,
    /// Whether the harness must run isolated from the model server.
    #[serde(default)]
    pub isolation_required: bool,
}

/// The whole mapping file: harness name -> declaration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MappingFile {
    #[serde(default)]
    pub harness: BTreeMap<String, HarnessMapping>,
}

impl MappingFile {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn get(&self, harness: &str) -> Option<&HarnessMapping> {
        self.harness.get(harness)
    }
}

/// SHA-256 hex of the mapping file bytes, as recorded in the generated
/// task-definitions artifact.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_file_parses() {
        let file: MappingFile = toml::from_str(
            r#"
[harness.simple-evals]
container = "nvcr.io/eval-factory/simple-evals:25.10"
isolation_required = true

[harness.lm-harness]
container = "nvcr.io/eval-factory/lm-harness:25.10"
"#,
        )
        .unwrap();
        assert_eq!(file.harness.len(), 2);
        assert!(file.get("simple-evals").unwrap().isolation_required);
        assert!(!file.get("lm-harness").unwrap().isolation_required);
        assert!(file.get("nope").is_none());
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = checksum(b"content");
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum(b"content"));
        assert_ne!(a, checksum(b"other"));
    }
}
