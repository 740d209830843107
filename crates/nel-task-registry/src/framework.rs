//! `framework.yml` parsing.
//!
//! The manifest a harness container ships under `/opt/metadata/` enumerates
//! the evaluations it supports. Only the fields the launcher consumes are
//! modeled; unknown keys pass through `defaults` untouched.

use serde::Deserialize;

/// Identity block of a framework manifest.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FrameworkInfo {
    pub name: String,
}

/// One evaluation declared by the harness.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EvaluationDecl {
    pub name: String,
    #[serde(default = "default_endpoint_type")]
    pub endpoint_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_env_vars: Vec<String>,
    #[serde(default)]
    pub defaults: serde_json::Value,
}

fn default_endpoint_type() -> String {
    "chat".to_string()
}

/// The parsed `framework.yml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FrameworkManifest {
    pub framework: FrameworkInfo,
    #[serde(default)]
    pub evaluations: Vec<EvaluationDecl>,
}

impl FrameworkManifest {
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }
}
