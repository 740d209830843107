//! Registry credential resolution.
//!
//! Priority order: explicit constructor arguments, then the local Docker
//! credentials file (`~/.docker/config.json`), then anonymous.

use base64::Engine;
use std::path::Path;
use tracing::debug;

/// Username/password pair for registry basic auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// `user:pass` encoded for an `Authorization: Basic` header.
    pub fn basic_token(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password))
    }

    /// Look up credentials for `registry` in the caller's Docker config.
    pub fn from_docker_config(registry: &str) -> Option<Self> {
        let path = dirs::home_dir()?.join(".docker").join("config.json");
        Self::from_docker_config_file(&path, registry)
    }

    fn from_docker_config_file(path: &Path, registry: &str) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let config: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let auth = config.get("auths")?.get(registry)?.get("auth")?.as_str()?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        debug!(registry, username, "using credentials from docker config");
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_basic_token_round_trips() {
        let creds = Credentials {
            username: "user".to_string(),
            password: "pa:ss".to_string(),
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(creds.basic_token())
            .unwrap();
        assert_eq!(decoded, b"user:pa:ss");
    }

    #[test]
    fn test_docker_config_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"auths": {{"nvcr.io": {{"auth": "{}"}}}}}}"#,
            auth
        )
        .unwrap();

        let creds = Credentials::from_docker_config_file(&path, "nvcr.io").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
        assert!(Credentials::from_docker_config_file(&path, "ghcr.io").is_none());
    }
}
