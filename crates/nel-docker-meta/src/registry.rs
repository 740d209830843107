//! Registry authenticators and the manifest/blob API.
//!
//! Two authentication schemes are supported behind one client: the
//! bearer-challenge flow (registries that answer `GET /v2/` with a
//! `WWW-Authenticate: Bearer` challenge) and the fixed JWT-issuing endpoint
//! some self-hosted registries expose. Both fall back to anonymous access
//! when no credentials are available.

use crate::credentials::Credentials;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Per-call deadline for manifest and token requests. Blob downloads are
/// unbounded; the layer-size filter keeps them small.
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(60);

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// One layer descriptor out of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: String,
    pub size: u64,
}

/// A fetched image manifest plus its canonical digest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub raw: serde_json::Value,
    /// `sha256:<hex>` over the canonical (sorted-key) JSON serialization.
    pub digest: String,
}

impl Manifest {
    /// Build a manifest from its parsed document, computing the digest.
    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let canonical = serde_json::to_vec(&raw)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&canonical)));
        Ok(Self { raw, digest })
    }

    /// The manifest's layers, base-to-top. Missing `layers` is fatal.
    pub fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        let layers = self
            .raw
            .get("layers")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Manifest("manifest has no 'layers' array".to_string()))?;
        layers
            .iter()
            .map(|layer| {
                let digest = layer
                    .get("digest")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Manifest("layer missing 'digest'".to_string()))?;
                let size = layer.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(LayerDescriptor {
                    digest: digest.to_string(),
                    size,
                })
            })
            .collect()
    }

    /// For a multi-platform index: the digest of the linux/amd64 image (or
    /// the first entry when no platform matches).
    pub fn platform_manifest_digest(&self) -> Option<String> {
        let entries = self.raw.get("manifests")?.as_array()?;
        let pick = entries
            .iter()
            .find(|m| {
                let platform = &m["platform"];
                platform["os"] == "linux" && platform["architecture"] == "amd64"
            })
            .or_else(|| entries.first())?;
        pick.get("digest").and_then(|v| v.as_str()).map(str::to_string)
    }

    fn is_index(&self) -> bool {
        self.raw.get("layers").is_none() && self.raw.get("manifests").is_some()
    }
}

/// Capability set every registry client provides.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Acquire (or refresh) a pull token for `repository`.
    async fn authenticate(&self, repository: &str) -> Result<()>;

    /// Fetch the image manifest, following multi-platform indexes.
    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest>;

    /// Download one blob by digest.
    async fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>>;
}

/// Which token-issuing flow the registry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAuthKind {
    /// `GET /v2/` returns a `WWW-Authenticate: Bearer realm=...` challenge.
    BearerChallenge,
    /// A fixed `/jwt/auth` endpoint issues tokens.
    JwtEndpoint,
}

/// HTTP client for one registry host.
#[derive(Debug)]
pub struct RegistryHttpClient {
    base: Url,
    http: reqwest::Client,
    auth_kind: RegistryAuthKind,
    credentials: Option<Credentials>,
    token: Mutex<Option<String>>,
}

impl RegistryHttpClient {
    /// Create a client for `registry` (host, optionally `host:port`).
    ///
    /// Credentials resolve in priority order: the explicit argument, then the
    /// caller's Docker config, then anonymous.
    pub fn new(
        registry: &str,
        auth_kind: RegistryAuthKind,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let base = Url::parse(&format!("https://{}", registry))
            .map_err(|_| Error::InvalidReference(registry.to_string()))?;
        let credentials = credentials.or_else(|| Credentials::from_docker_config(registry));
        let http = reqwest::Client::builder()
            .user_agent("nemo-evaluator-launcher/0.1")
            .build()?;
        Ok(Self {
            base,
            http,
            auth_kind,
            credentials,
            token: Mutex::new(None),
        })
    }

    async fn token_for(&self, repository: &str) -> Result<Option<String>> {
        let mut slot = self.token.lock().await;
        if slot.is_none() {
            *slot = self.fetch_token(repository).await?;
        }
        Ok(slot.clone())
    }

    async fn fetch_token(&self, repository: &str) -> Result<Option<String>> {
        match self.auth_kind {
            RegistryAuthKind::BearerChallenge => self.bearer_challenge_token(repository).await,
            RegistryAuthKind::JwtEndpoint => self.jwt_endpoint_token(repository).await,
        }
    }

    /// `GET /v2/`, parse the challenge, exchange basic auth for a token.
    async fn bearer_challenge_token(&self, repository: &str) -> Result<Option<String>> {
        let probe_url = self.base.join("/v2/").expect("static path");
        let probe = self
            .http
            .get(probe_url)
            .timeout(REGISTRY_TIMEOUT)
            .send()
            .await
            .map_err(map_send_error)?;

        if probe.status() != StatusCode::UNAUTHORIZED {
            // Registry does not require auth.
            return Ok(None);
        }
        let challenge = probe
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(parse_bearer_challenge)
            .unwrap_or_default();
        let realm = match challenge.get("realm") {
            Some(realm) => realm.clone(),
            None => return Ok(None),
        };

        let mut token_url = Url::parse(&realm)
            .map_err(|_| Error::Auth(format!("unparseable challenge realm '{}'", realm)))?;
        if let Some(service) = challenge.get("service") {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        token_url
            .query_pairs_mut()
            .append_pair("scope", &format!("repository:{}:pull", repository));

        let mut request = self.http.get(token_url).timeout(REGISTRY_TIMEOUT);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(map_send_error)?;
        self.extract_token(response).await
    }

    /// `GET /jwt/auth?service=container_registry&scope=repository:{repo}:pull`
    async fn jwt_endpoint_token(&self, repository: &str) -> Result<Option<String>> {
        let mut token_url = self.base.join("/jwt/auth").expect("static path");
        token_url
            .query_pairs_mut()
            .append_pair("service", "container_registry")
            .append_pair("scope", &format!("repository:{}:pull", repository));

        let mut request = self.http.get(token_url).timeout(REGISTRY_TIMEOUT);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(map_send_error)?;
        self.extract_token(response).await
    }

    async fn extract_token(&self, response: Response) -> Result<Option<String>> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if self.credentials.is_some() {
                return Err(Error::Auth(format!(
                    "registry rejected supplied credentials (status {})",
                    status
                )));
            }
            // Anonymous and denied: proceed without a token and let the
            // manifest request report the definitive failure.
            warn!(status = %status, "anonymous token request denied");
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(Error::Transient {
                status: status.as_u16(),
                message: "token endpoint unavailable".to_string(),
            });
        }
        let body: serde_json::Value = response.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Auth("token endpoint returned no token".to_string()))?;
        Ok(Some(token.to_string()))
    }

    async fn get_json(&self, repository: &str, path: &str) -> Result<serde_json::Value> {
        let url = self
            .base
            .join(path)
            .map_err(|_| Error::InvalidReference(path.to_string()))?;
        let mut request = self
            .http
            .get(url)
            .timeout(REGISTRY_TIMEOUT)
            .header(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        if let Some(token) = self.token_for(repository).await? {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(self.status_error(status, path))
    }

    fn status_error(&self, status: StatusCode, path: &str) -> Error {
        if status == StatusCode::UNAUTHORIZED {
            if self.credentials.is_some() {
                Error::Auth(format!("registry rejected supplied credentials for {}", path))
            } else {
                Error::Auth(format!("registry requires credentials for {}", path))
            }
        } else if status.is_server_error() {
            Error::Transient {
                status: status.as_u16(),
                message: format!("registry error for {}", path),
            }
        } else {
            Error::Manifest(format!("registry returned {} for {}", status, path))
        }
    }
}

#[async_trait]
impl RegistryApi for RegistryHttpClient {
    async fn authenticate(&self, repository: &str) -> Result<()> {
        self.token_for(repository).await.map(|_| ())
    }

    async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let manifest = Manifest::from_value(self.get_json(repository, &path).await?)?;

        if manifest.is_index() {
            let digest = manifest.platform_manifest_digest().ok_or_else(|| {
                Error::Manifest("multi-platform index has no usable entry".to_string())
            })?;
            debug!(%digest, "following multi-platform index");
            let path = format!("/v2/{}/manifests/{}", repository, digest);
            return Manifest::from_value(self.get_json(repository, &path).await?);
        }
        Ok(manifest)
    }

    async fn get_blob(&self, repository: &str, digest: &str) -> Result<Vec<u8>> {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let url = self
            .base
            .join(&path)
            .map_err(|_| Error::InvalidReference(path.clone()))?;
        // No request timeout: blob size is bounded by the layer-size filter.
        let mut request = self.http.get(url);
        if let Some(token) = self.token_for(repository).await? {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?.to_vec());
        }
        Err(self.status_error(status, &path))
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transient {
            status: 408,
            message: "registry request timed out".to_string(),
        }
    } else {
        Error::Http(e)
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` into its parts.
fn parse_bearer_challenge(header: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let rest = header.strip_prefix("Bearer ").unwrap_or(header);
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            out.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_challenge_parsing() {
        let parsed = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:a/b:pull""#,
        );
        assert_eq!(parsed["realm"], "https://auth.example.com/token");
        assert_eq!(parsed["service"], "registry.example.com");
        assert_eq!(parsed["scope"], "repository:a/b:pull");
    }

    #[test]
    fn test_manifest_digest_is_order_insensitive() {
        // serde_json sorts object keys, so semantically equal documents hash
        // identically regardless of source ordering.
        let a = Manifest::from_value(json!({"b": 1, "a": [1, 2]})).unwrap();
        let b = Manifest::from_value(json!({"a": [1, 2], "b": 1})).unwrap();
        assert_eq!(a.digest, b.digest);
        assert!(a.digest.starts_with("sha256:"));
    }

    #[test]
    fn test_layers_extraction() {
        let manifest = Manifest::from_value(json!({
            "layers": [
                {"digest": "sha256:aaa", "size": 10},
                {"digest": "sha256:bbb", "size": 20}
            ]
        }))
        .unwrap();
        let layers = manifest.layers().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].digest, "sha256:bbb");

        let empty = Manifest::from_value(json!({"schemaVersion": 2})).unwrap();
        assert!(matches!(empty.layers(), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_index_platform_selection() {
        let index = Manifest::from_value(json!({
            "manifests": [
                {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64"}},
                {"digest": "sha256:amd", "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        }))
        .unwrap();
        assert_eq!(index.platform_manifest_digest().unwrap(), "sha256:amd");
        assert!(index.is_index());
    }
}
