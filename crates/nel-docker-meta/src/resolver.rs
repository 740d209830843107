//! The partial-pull resolver.

use crate::cache::{CacheEntry, MetaCache};
use crate::credentials::Credentials;
use crate::reference::ImageReference;
use crate::registry::{RegistryApi, RegistryAuthKind, RegistryHttpClient};
use crate::Result;
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::{debug, info, warn};

/// Layers at or above this size are never candidates: metadata layers are
/// tiny, model-weight layers are huge and never contain the manifest file.
pub const DEFAULT_MAX_LAYER_SIZE: u64 = 100 * 1024;

/// Standard location of the harness task manifest inside images.
pub const FRAMEWORK_PREFIX: &str = "/opt/metadata/";
pub const FRAMEWORK_FILENAME: &str = "framework.yml";

/// A successful partial-pull resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    /// Member path inside the image, e.g. `/opt/metadata/x/framework.yml`.
    pub path: String,
    pub content: Vec<u8>,
    pub manifest_digest: String,
}

/// Resolver over one registry client and one cache directory.
#[derive(Debug)]
pub struct MetadataResolver<C> {
    client: C,
    cache: MetaCache,
}

impl<C: RegistryApi> MetadataResolver<C> {
    pub fn new(client: C, cache: MetaCache) -> Self {
        Self { client, cache }
    }

    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    /// Locate the newest file under `prefix` named `filename` without pulling
    /// the image. Returns `None` when no candidate layer contains a match.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_file_matching_pattern(
        &self,
        repository: &str,
        reference: &str,
        prefix: &str,
        filename: &str,
        max_layer_size: Option<u64>,
        docker_id: Option<&str>,
        use_cache: bool,
    ) -> Result<Option<FoundFile>> {
        let max_layer_size = max_layer_size.unwrap_or(DEFAULT_MAX_LAYER_SIZE);
        let pattern = pattern_key(prefix, filename);

        self.client.authenticate(repository).await?;
        let manifest = self.client.get_manifest(repository, reference).await?;

        if let (Some(docker_id), true) = (docker_id, use_cache) {
            if let Some(entry) = self.cache.load(docker_id, &pattern)? {
                if entry.digest == manifest.digest {
                    debug!(docker_id, pattern, "metadata cache hit");
                    return Ok(Some(FoundFile {
                        path: entry.cached_file_path,
                        content: entry.metadata.into_bytes(),
                        manifest_digest: entry.digest,
                    }));
                }
                info!(
                    docker_id,
                    cached = %entry.digest,
                    live = %manifest.digest,
                    "manifest digest changed, invalidating cache entry"
                );
                self.cache.invalidate(docker_id, &pattern)?;
            }
        }

        let layers = manifest.layers()?;
        let mut seen_names: Vec<(usize, Vec<String>)> = Vec::new();

        // Layers are additive: walking in reverse means the most recent
        // version of any file wins, and a match short-circuits.
        for (index, layer) in layers.iter().enumerate().rev() {
            if layer.size >= max_layer_size {
                continue;
            }
            let blob = self.client.get_blob(repository, &layer.digest).await?;
            match scan_layer(&blob, prefix, filename) {
                Ok(ScanOutcome {
                    found: Some((path, content)),
                    ..
                }) => {
                    // Content must be valid UTF-8 for the cache format.
                    let text = String::from_utf8(content)?;
                    if let (Some(docker_id), true) = (docker_id, use_cache) {
                        self.cache.store(&CacheEntry {
                            docker_id: docker_id.to_string(),
                            pattern: pattern.clone(),
                            cached_file_path: path.clone(),
                            metadata: text.clone(),
                            digest: manifest.digest.clone(),
                        })?;
                    }
                    return Ok(Some(FoundFile {
                        path,
                        content: text.into_bytes(),
                        manifest_digest: manifest.digest,
                    }));
                }
                Ok(ScanOutcome { names, .. }) => {
                    seen_names.push((index, names));
                }
                Err(e) => {
                    warn!(layer = index, error = %e, "skipping undecodable layer");
                }
            }
        }

        for (index, names) in &seen_names {
            debug!(layer = index, members = ?names, "no match in layer");
        }
        Ok(None)
    }
}

/// Convenience wrapper: resolve `/opt/metadata/**/framework.yml` for a
/// container reference, using the default cache and the bearer-challenge
/// authenticator with Docker-config credentials.
pub async fn extract_framework_yml(container_ref: &str) -> Result<Option<(Vec<u8>, String)>> {
    extract_framework_yml_with_credentials(container_ref, None).await
}

/// As [`extract_framework_yml`], with explicit credentials.
pub async fn extract_framework_yml_with_credentials(
    container_ref: &str,
    credentials: Option<Credentials>,
) -> Result<Option<(Vec<u8>, String)>> {
    let image = ImageReference::parse(container_ref)?;
    let client =
        RegistryHttpClient::new(&image.registry, RegistryAuthKind::BearerChallenge, credentials)?;
    let resolver = MetadataResolver::new(client, MetaCache::open_default()?);
    let found = resolver
        .find_file_matching_pattern(
            &image.repository,
            &image.reference,
            FRAMEWORK_PREFIX,
            FRAMEWORK_FILENAME,
            None,
            Some(container_ref),
            true,
        )
        .await?;
    Ok(found.map(|f| (f.content, f.manifest_digest)))
}

fn pattern_key(prefix: &str, filename: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), filename)
}

struct ScanOutcome {
    found: Option<(String, Vec<u8>)>,
    /// First few member names, for diagnostics when nothing matches.
    names: Vec<String>,
}

/// Stream one gzipped tar layer looking for `prefix`/.../`filename`.
fn scan_layer(blob: &[u8], prefix: &str, filename: &str) -> Result<ScanOutcome> {
    const DIAG_NAMES_PER_LAYER: usize = 10;

    let normalized_prefix = {
        let p = prefix.trim_start_matches('/').trim_end_matches('/');
        format!("{}/", p)
    };

    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let member_path = entry.path()?.to_string_lossy().into_owned();
        if names.len() < DIAG_NAMES_PER_LAYER {
            names.push(member_path.clone());
        }
        let normalized = member_path.trim_start_matches("./").trim_start_matches('/');
        let basename = normalized.rsplit('/').next().unwrap_or(normalized);
        if normalized.starts_with(&normalized_prefix) && basename == filename {
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut content)?;
            let resolved = format!("/{}", normalized);
            return Ok(ScanOutcome {
                found: Some((resolved, content)),
                names,
            });
        }
    }
    Ok(ScanOutcome { found: None, names })
}
