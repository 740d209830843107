//! Image reference parsing.

use std::fmt;

/// A parsed `registry/repository:tag` (or `@sha256:...`) image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `nvcr.io`.
    pub registry: String,
    /// Repository path, e.g. `eval-factory/simple-evals`.
    pub repository: String,
    /// Tag or digest reference, e.g. `25.10` or `sha256:...`.
    pub reference: String,
}

impl ImageReference {
    /// Parse a reference like `nvcr.io/eval-factory/simple-evals:25.10`.
    ///
    /// A bare name with no registry component resolves against Docker Hub
    /// (`registry-1.docker.io`, `library/` namespace), matching `docker pull`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let bad = || crate::Error::InvalidReference(s.to_string());
        if s.is_empty() {
            return Err(bad());
        }

        let (name, reference) = if let Some((name, digest)) = s.split_once('@') {
            (name, digest.to_string())
        } else {
            // The tag separator is the last ':' after the final '/'.
            match s.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
                _ => (s, "latest".to_string()),
            }
        };
        if name.is_empty() || reference.is_empty() {
            return Err(bad());
        }

        let (registry, repository) = match name.split_once('/') {
            // A host has a dot or port (or is "localhost"); otherwise the
            // whole name is a Hub repository.
            Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                (host.to_string(), rest.to_string())
            }
            Some(_) => ("registry-1.docker.io".to_string(), name.to_string()),
            None => ("registry-1.docker.io".to_string(), format!("library/{}", name)),
        };
        if repository.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reference.starts_with("sha256:") {
            write!(f, "{}/{}@{}", self.registry, self.repository, self.reference)
        } else {
            write!(f, "{}/{}:{}", self.registry, self.repository, self.reference)
        }
    }
}
