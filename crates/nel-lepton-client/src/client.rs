//! HTTP implementation of the platform API.

use crate::models::*;
use crate::{Error, LeptonApi, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// REST client for one Lepton workspace.
#[derive(Debug, Clone)]
pub struct LeptonClient {
    http_client: HttpClient,
    base_url: Url,
    token: Option<String>,
}

impl LeptonClient {
    /// Create a client for a workspace URL with an optional bearer token.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let http_client = HttpClient::builder()
            .user_agent("nemo-evaluator-launcher/0.1")
            .build()?;
        Ok(Self {
            http_client,
            base_url,
            token,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl serde::Serialize + Sync)>,
    ) -> Result<T> {
        let url = self.base_url.join(path)?;
        debug!(%url, %method, "lepton api call");
        let mut request = self.http_client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        self.handle_response(response, path).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        path: &str,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            // DELETE and friends return empty bodies.
            let text = if text.is_empty() { "null".to_string() } else { text };
            return Ok(serde_json::from_str(&text)?);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            if path.contains("/deployments/") {
                return Err(Error::EndpointNotFound(path.to_string()));
            }
            if path.contains("/jobs/") {
                return Err(Error::JobNotFound(path.to_string()));
            }
        }
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl LeptonApi for LeptonClient {
    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointStatus> {
        self.request(Method::POST, "/api/v1/deployments", Some(spec)).await
    }

    async fn get_endpoint(&self, name: &str) -> Result<EndpointStatus> {
        let path = format!("/api/v1/deployments/{}", name);
        self.request(Method::GET, &path, None::<&()>).await
    }

    async fn delete_endpoint(&self, name: &str) -> Result<()> {
        let path = format!("/api/v1/deployments/{}", name);
        let _: serde_json::Value = self.request(Method::DELETE, &path, None::<&()>).await?;
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        let created: JobStatus = self.request(Method::POST, "/api/v1/jobs", Some(spec)).await?;
        Ok(created.external_id)
    }

    async fn get_job(&self, external_id: &str) -> Result<JobStatus> {
        let path = format!("/api/v1/jobs/{}", external_id);
        self.request(Method::GET, &path, None::<&()>).await
    }

    async fn delete_job(&self, external_id: &str) -> Result<()> {
        let path = format!("/api/v1/jobs/{}", external_id);
        let _: serde_json::Value = self.request(Method::DELETE, &path, None::<&()>).await?;
        Ok(())
    }
}
