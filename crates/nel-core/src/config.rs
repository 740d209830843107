//! Typed run-configuration model.
//!
//! The CLI/wizard collaborators hand the launcher a YAML mapping; this module
//! owns its schema. Parsing goes through a raw `serde_json::Value` first so
//! the `MISSING`-sentinel validation and `${VAR}` resolution (see
//! [`crate::envsub`]) can walk the full tree before anything is typed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Which backend executes the jobs of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Local,
    Slurm,
    Lepton,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
            Self::Lepton => "lepton",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model-server deployment flavor stood up before evaluation jobs run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    /// The caller supplies the target URL; nothing is deployed.
    #[default]
    None,
    Vllm,
    Sglang,
    Nim,
}

/// `executor.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub kind: ExecutorKind,
    /// SLURM login node (or SSH host for remote artifact pulls).
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub walltime: Option<String>,
    pub gres: Option<String>,
    /// Remote directory sbatch scripts and outputs live under.
    pub remote_rundir: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    pub lepton_platform: Option<LeptonPlatformConfig>,
}

/// `executor.lepton_platform.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeptonPlatformConfig {
    pub workspace_url: Option<String>,
    /// Name of the env var holding the workspace token.
    pub token_env: Option<String>,
    pub node_group: Option<String>,
    pub resource_shape: Option<String>,
    pub job_timeout_secs: Option<u64>,
    /// Endpoint readiness deadline; defaults to 600 s when absent.
    pub endpoint_readiness_timeout_secs: Option<u64>,
}

/// `deployment.*` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentConfig {
    #[serde(rename = "type", default)]
    pub kind: DeploymentKind,
    pub image: Option<String>,
    pub checkpoint: Option<String>,
    pub hf_model_handle: Option<String>,
    pub served_model_name: Option<String>,
    pub tensor_parallel: Option<u32>,
    pub endpoints: Option<u32>,
    /// Vendor-specific deployment knobs, passed through opaquely.
    pub lepton_config: Option<serde_json::Value>,
}

/// `target.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub api_endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub url: Option<String>,
    pub model_id: String,
    pub api_key_name: Option<String>,
}

/// One entry of `evaluation.tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// `<harness>.<task>` or a bare task name resolved against the registry.
    pub name: String,
    /// Per-task harness parameter overrides, passed through to the harness.
    pub nemo_evaluator_config: Option<serde_json::Value>,
}

impl TaskSpec {
    /// Split `<harness>.<task>` into its parts; bare names yield no harness.
    pub fn split_name(&self) -> (Option<&str>, &str) {
        match self.name.split_once('.') {
            Some((harness, task)) => (Some(harness), task),
            None => (None, self.name.as_str()),
        }
    }
}

/// `evaluation.env_vars.*`: env-var name -> `${VAR}` reference, per stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvVarSections {
    #[serde(default)]
    pub deployment: BTreeMap<String, String>,
    #[serde(default)]
    pub evaluation: BTreeMap<String, String>,
}

/// `evaluation.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub env_vars: EnvVarSections,
}

/// `execution.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub output_dir: PathBuf,
}

/// One `exporters` entry; sink-specific keys are kept opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub dest: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// The validated run configuration the API facade consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    pub target: TargetConfig,
    pub evaluation: EvaluationConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub exporters: Vec<ExporterConfig>,
}

impl RunConfig {
    /// Parse a YAML document, reject `MISSING` sentinels, resolve `${VAR}`
    /// references, and type the result.
    ///
    /// Returns the typed configuration together with the fully resolved raw
    /// tree; the raw tree is what gets frozen into each job record.
    pub fn from_yaml_str(yaml: &str) -> crate::Result<(Self, serde_json::Value)> {
        let raw: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(raw)
    }

    /// Same as [`RunConfig::from_yaml_str`] but starting from an already
    /// assembled tree (the wizard hands the facade one of these).
    pub fn from_value(raw: serde_json::Value) -> crate::Result<(Self, serde_json::Value)> {
        crate::envsub::validate_no_missing(&raw)?;
        let resolved = crate::envsub::resolve_env_vars(raw)?;
        let config: RunConfig = serde_json::from_value(resolved.clone())?;
        if config.evaluation.tasks.is_empty() {
            return Err(crate::Error::config("evaluation.tasks must not be empty"));
        }
        Ok((config, resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
executor:
  type: local
target:
  api_endpoint:
    url: http://x/v1
    model_id: meta/llama
evaluation:
  tasks:
    - name: ns_aime2025
execution:
  output_dir: /tmp/results
"#;

    #[test]
    fn test_minimal_config_parses() {
        let (config, raw) = RunConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.executor.kind, ExecutorKind::Local);
        assert_eq!(config.deployment.kind, DeploymentKind::None);
        assert_eq!(config.evaluation.tasks.len(), 1);
        assert_eq!(raw["target"]["api_endpoint"]["model_id"], "meta/llama");
    }

    #[test]
    fn test_missing_sentinel_is_fatal() {
        let yaml = MINIMAL.replace("meta/llama", "MISSING");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("target.api_endpoint.model_id"));
    }

    #[test]
    fn test_empty_task_list_is_rejected() {
        let yaml = MINIMAL.replace("    - name: ns_aime2025\n", "");
        assert!(RunConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_task_name_split() {
        let spec = TaskSpec {
            name: "simple-evals.aime2025".to_string(),
            nemo_evaluator_config: None,
        };
        assert_eq!(spec.split_name(), (Some("simple-evals"), "aime2025"));
        let bare = TaskSpec {
            name: "mmlu".to_string(),
            nemo_evaluator_config: None,
        };
        assert_eq!(bare.split_name(), (None, "mmlu"));
    }
}
