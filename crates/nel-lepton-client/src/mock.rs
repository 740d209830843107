//! In-memory platform double for executor tests.

use crate::models::*;
use crate::{Error, LeptonApi, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Scripted, inspectable implementation of [`LeptonApi`].
///
/// Endpoints become `Ready` after a configurable number of status polls; jobs
/// report a scripted state. Every call is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockLeptonClient {
    state: Mutex<MockState>,
    /// Status polls before a created endpoint reports `Ready`.
    pub readiness_polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    endpoints: BTreeMap<String, EndpointRecord>,
    jobs: BTreeMap<String, String>,
    next_job: u64,
    job_states: BTreeMap<String, String>,
    pub calls: Vec<String>,
}

#[derive(Debug)]
struct EndpointRecord {
    polls_seen: u32,
}

impl MockLeptonClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readiness_polls(readiness_polls: u32) -> Self {
        Self {
            readiness_polls,
            ..Self::default()
        }
    }

    /// Script the state `get_job` reports for `external_id`.
    pub fn set_job_state(&self, external_id: &str, state: &str) {
        let mut s = self.state.lock().unwrap();
        s.job_states.insert(external_id.to_string(), state.to_string());
    }

    /// All API calls made so far, e.g. `delete_endpoint ep-x`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.state.lock().unwrap().endpoints.keys().cloned().collect()
    }
}

#[async_trait]
impl LeptonApi for MockLeptonClient {
    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointStatus> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("create_endpoint {}", spec.name));
        s.endpoints.insert(spec.name.clone(), EndpointRecord { polls_seen: 0 });
        Ok(EndpointStatus {
            name: spec.name.clone(),
            state: "Starting".to_string(),
            external_url: None,
        })
    }

    async fn get_endpoint(&self, name: &str) -> Result<EndpointStatus> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("get_endpoint {}", name));
        let readiness = self.readiness_polls;
        let record = s
            .endpoints
            .get_mut(name)
            .ok_or_else(|| Error::EndpointNotFound(name.to_string()))?;
        record.polls_seen += 1;
        if record.polls_seen > readiness {
            Ok(EndpointStatus {
                name: name.to_string(),
                state: "Ready".to_string(),
                external_url: Some(format!("https://{}.lepton.example/v1", name)),
            })
        } else {
            Ok(EndpointStatus {
                name: name.to_string(),
                state: "Starting".to_string(),
                external_url: None,
            })
        }
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("delete_endpoint {}", name));
        s.endpoints
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::EndpointNotFound(name.to_string()))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("create_job {}", spec.name));
        s.next_job += 1;
        let external_id = format!("lj-{}", s.next_job);
        s.jobs.insert(external_id.clone(), spec.name.clone());
        s.job_states.insert(external_id.clone(), "Pending".to_string());
        Ok(external_id)
    }

    async fn get_job(&self, external_id: &str) -> Result<JobStatus> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("get_job {}", external_id));
        let state = s
            .job_states
            .get(external_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(external_id.to_string()))?;
        Ok(JobStatus {
            external_id: external_id.to_string(),
            state,
        })
    }

    async fn delete_job(&self, external_id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(format!("delete_job {}", external_id));
        s.jobs
            .remove(external_id)
            .map(|_| ())
            .ok_or_else(|| Error::JobNotFound(external_id.to_string()))?;
        s.job_states.remove(external_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_becomes_ready_after_polls() {
        let mock = MockLeptonClient::with_readiness_polls(2);
        let spec = EndpointSpec {
            name: "ep-x".to_string(),
            image: "img".to_string(),
            env_vars: BTreeMap::new(),
            node_group: None,
            resource_shape: None,
            replicas: 1,
        };
        mock.create_endpoint(&spec).await.unwrap();
        assert_eq!(mock.get_endpoint("ep-x").await.unwrap().parsed_state(), EndpointState::Starting);
        assert_eq!(mock.get_endpoint("ep-x").await.unwrap().parsed_state(), EndpointState::Starting);
        let ready = mock.get_endpoint("ep-x").await.unwrap();
        assert_eq!(ready.parsed_state(), EndpointState::Ready);
        assert!(ready.external_url.is_some());
    }

    #[tokio::test]
    async fn test_job_lifecycle_and_call_log() {
        let mock = MockLeptonClient::new();
        let spec = JobSpec {
            name: "job-0".to_string(),
            image: "img".to_string(),
            command: "run".to_string(),
            env_vars: BTreeMap::new(),
            mounts: vec![],
            node_group: None,
            resource_shape: None,
            timeout_secs: None,
        };
        let id = mock.create_job(&spec).await.unwrap();
        mock.set_job_state(&id, "Succeeded");
        assert_eq!(mock.get_job(&id).await.unwrap().parsed_state(), JobState::Succeeded);
        mock.delete_job(&id).await.unwrap();
        assert!(mock.get_job(&id).await.is_err());
        assert!(mock.calls().iter().any(|c| c == &format!("delete_job {}", id)));
    }
}
