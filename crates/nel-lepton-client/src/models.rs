//! Wire types for the Lepton platform API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Platform endpoint states the launcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    Ready,
    Starting,
    Updating,
    Stopped,
    Unknown,
}

impl EndpointState {
    /// Parse the platform's free-form state string.
    pub fn parse(s: &str) -> Self {
        match s {
            "Ready" => Self::Ready,
            "Starting" => Self::Starting,
            "Updating" => Self::Updating,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// Request body for endpoint creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Sanitized `[a-z0-9-]`, at most 36 characters.
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub node_group: Option<String>,
    pub resource_shape: Option<String>,
    /// Number of replicas behind the endpoint.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

/// Endpoint record as returned by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub state: String,
    /// Externally reachable URL, present once the endpoint is up.
    pub external_url: Option<String>,
}

impl EndpointStatus {
    pub fn parsed_state(&self) -> EndpointState {
        EndpointState::parse(&self.state)
    }
}

/// Platform job states the launcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Succeeded,
    Running,
    Pending,
    Starting,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Succeeded" => Self::Succeeded,
            "Running" => Self::Running,
            "Pending" => Self::Pending,
            "Starting" => Self::Starting,
            "Failed" => Self::Failed,
            "Cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

/// Request body for job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    /// Shell command the job container runs.
    pub command: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    pub node_group: Option<String>,
    pub resource_shape: Option<String>,
    /// Seconds before the platform kills the job.
    pub timeout_secs: Option<u64>,
}

/// Job record as returned by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub external_id: String,
    pub state: String,
}

impl JobStatus {
    pub fn parsed_state(&self) -> JobState {
        JobState::parse(&self.state)
    }
}
