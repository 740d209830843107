//! Task definition registry.
//!
//! Combines two inputs into the process-wide `(harness, task)` table: the
//! curated TOML mapping file declaring each known harness's container image,
//! and the `framework.yml` payloads the metadata resolver pulled out of those
//! containers. A generated task-definitions artifact carries the checksum of
//! the mapping file it was built from; a mismatch at load time means the
//! artifact is stale and is a fatal configuration error.

pub mod framework;
pub mod mapping;

pub use framework::FrameworkManifest;
pub use mapping::{HarnessMapping, MappingFile};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Errors raised while loading or querying task definitions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mapping file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("framework manifest error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid harness name '{0}': must be lowercase alphanumeric-plus-hyphen")]
    InvalidHarness(String),

    #[error(
        "task-definitions artifact is stale: mapping checksum {artifact} \
         does not match mapping file checksum {current}"
    )]
    StaleArtifact { artifact: String, current: String },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task name '{0}' is ambiguous across harnesses: {1}")]
    AmbiguousTask(String, String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The registry record describing how to invoke one task within a harness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub harness: String,
    pub name: String,
    /// Container image reference the harness ships in.
    pub container: String,
    /// Manifest digest the definition was verified against when cached.
    pub container_digest: String,
    /// `chat`, `completions`, `vlm`, `embedding`, ... (open set).
    pub endpoint_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_env_vars: Vec<String>,
    /// Nested default harness parameters, passed through to the harness.
    #[serde(default)]
    pub defaults: serde_json::Value,
}

/// The generated task-definitions artifact, one JSON document.
#[derive(Debug, Serialize, Deserialize)]
struct DefinitionsArtifact {
    /// SHA-256 of the mapping file the artifact was generated from.
    mapping_checksum: String,
    tasks: Vec<TaskDefinition>,
}

/// In-memory `(harness, task)` table.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    table: BTreeMap<(String, String), TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry from the curated mapping file and its generated
    /// definitions artifact, verifying the artifact is not stale.
    pub fn load(mapping_path: &Path, artifact_path: &Path) -> Result<Self> {
        let mapping_bytes = std::fs::read(mapping_path)?;
        let current = mapping::checksum(&mapping_bytes);

        let artifact: DefinitionsArtifact =
            serde_json::from_slice(&std::fs::read(artifact_path)?)?;
        if artifact.mapping_checksum != current {
            return Err(Error::StaleArtifact {
                artifact: artifact.mapping_checksum,
                current,
            });
        }

        // The mapping file must still parse; harness flags are read from it
        // at execution time.
        let text = String::from_utf8_lossy(&mapping_bytes);
        let _mapping: MappingFile = toml::from_str(&text)?;

        let mut registry = Self::new();
        for task in artifact.tasks {
            registry.insert(task)?;
        }
        debug!(tasks = registry.len(), "loaded task registry");
        Ok(registry)
    }

    /// Add the tasks a harness's `framework.yml` declares, pairing them with
    /// the container and digest the resolver verified.
    pub fn insert_framework(
        &mut self,
        harness: &str,
        container: &str,
        container_digest: &str,
        framework_yml: &[u8],
    ) -> Result<usize> {
        let manifest = FrameworkManifest::parse(framework_yml)?;
        let mut added = 0;
        for decl in manifest.evaluations {
            self.insert(TaskDefinition {
                harness: harness.to_string(),
                name: decl.name,
                container: container.to_string(),
                container_digest: container_digest.to_string(),
                endpoint_type: decl.endpoint_type,
                description: decl.description,
                required_env_vars: decl.required_env_vars,
                defaults: decl.defaults,
            })?;
            added += 1;
        }
        Ok(added)
    }

    /// Insert one normalized definition. Harness names are lowercased, task
    /// names trimmed; `(harness, name)` is the primary key.
    pub fn insert(&mut self, mut task: TaskDefinition) -> Result<()> {
        task.harness = task.harness.to_lowercase();
        task.name = task.name.trim().to_string();
        if task.harness.is_empty()
            || !task.harness.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidHarness(task.harness));
        }
        self.table.insert((task.harness.clone(), task.name.clone()), task);
        Ok(())
    }

    pub fn get(&self, harness: &str, name: &str) -> Option<&TaskDefinition> {
        self.table.get(&(harness.to_lowercase(), name.trim().to_string()))
    }

    /// Resolve a task spec name: `<harness>.<task>` is an exact lookup; a
    /// bare task name must match exactly one harness.
    pub fn resolve(&self, spec_name: &str) -> Result<&TaskDefinition> {
        if let Some((harness, task)) = spec_name.split_once('.') {
            return self.get(harness, task).ok_or_else(|| Error::UnknownTask(spec_name.to_string()));
        }
        let name = spec_name.trim();
        let matches: Vec<&TaskDefinition> =
            self.table.values().filter(|t| t.name == name).collect();
        match matches.as_slice() {
            [] => Err(Error::UnknownTask(spec_name.to_string())),
            [one] => Ok(one),
            many => Err(Error::AmbiguousTask(
                spec_name.to_string(),
                many.iter().map(|t| t.harness.as_str()).collect::<Vec<_>>().join(", "),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.table.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(harness: &str, name: &str) -> TaskDefinition {
        TaskDefinition {
            harness: harness.to_string(),
            name: name.to_string(),
            container: "nvcr.io/eval-factory/demo:1.0".to_string(),
            container_digest: "sha256:abc".to_string(),
            endpoint_type: "chat".to_string(),
            description: String::new(),
            required_env_vars: vec![],
            defaults: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_insert_normalizes_keys() {
        let mut registry = TaskRegistry::new();
        registry.insert(definition("Simple-Evals", "  aime2025 ")).unwrap();
        assert!(registry.get("simple-evals", "aime2025").is_some());
        assert!(registry.get("SIMPLE-EVALS", "aime2025").is_some());
    }

    #[test]
    fn test_invalid_harness_names_rejected() {
        let mut registry = TaskRegistry::new();
        assert!(registry.insert(definition("", "t")).is_err());
        assert!(registry.insert(definition("has space", "t")).is_err());
        assert!(registry.insert(definition("has_underscore", "t")).is_err());
    }

    #[test]
    fn test_resolve_qualified_and_bare() {
        let mut registry = TaskRegistry::new();
        registry.insert(definition("simple-evals", "aime2025")).unwrap();
        registry.insert(definition("lm-harness", "mmlu")).unwrap();
        registry.insert(definition("simple-evals", "mmlu")).unwrap();

        assert_eq!(registry.resolve("simple-evals.aime2025").unwrap().name, "aime2025");
        assert_eq!(registry.resolve("aime2025").unwrap().harness, "simple-evals");
        assert!(matches!(registry.resolve("mmlu"), Err(Error::AmbiguousTask(..))));
        assert!(matches!(registry.resolve("nope"), Err(Error::UnknownTask(_))));
    }

    #[test]
    fn test_insert_framework_manifest() {
        let yml = b"framework:\n  name: simple-evals\nevaluations:\n  - name: aime2025\n    endpoint_type: chat\n    description: math\n    required_env_vars: [JUDGE_API_KEY]\n    defaults:\n      temperature: 0.0\n";
        let mut registry = TaskRegistry::new();
        let added = registry
            .insert_framework("simple-evals", "nvcr.io/e/f:1", "sha256:d", yml)
            .unwrap();
        assert_eq!(added, 1);
        let task = registry.get("simple-evals", "aime2025").unwrap();
        assert_eq!(task.endpoint_type, "chat");
        assert_eq!(task.required_env_vars, vec!["JUDGE_API_KEY"]);
        assert_eq!(task.container_digest, "sha256:d");
        assert_eq!(task.defaults["temperature"], 0.0);
    }

    #[test]
    fn test_load_checks_artifact_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let mapping_path = dir.path().join("mapping.toml");
        std::fs::write(
            &mapping_path,
            "[harness.simple-evals]\ncontainer = \"nvcr.io/e/f:1\"\n",
        )
        .unwrap();
        let checksum = mapping::checksum(&std::fs::read(&mapping_path).unwrap());

        let artifact_path = dir.path().join("task-definitions.json");
        let artifact = serde_json::json!({
            "mapping_checksum": checksum,
            "tasks": [definition("simple-evals", "aime2025")]
        });
        std::fs::write(&artifact_path, artifact.to_string()).unwrap();

        let registry = TaskRegistry::load(&mapping_path, &artifact_path).unwrap();
        assert_eq!(registry.len(), 1);

        // Stale artifact: mapping file changed after generation.
        std::fs::write(&mapping_path, "[harness.other]\ncontainer = \"x:1\"\n").unwrap();
        assert!(matches!(
            TaskRegistry::load(&mapping_path, &artifact_path),
            Err(Error::StaleArtifact { .. })
        ));
    }
}
