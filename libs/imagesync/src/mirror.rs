//! Mirror fallback orchestration.
//!
//! A logical image can be reachable under several equivalent names. An
//! external resolver supplies the ordered candidate list; the mounter
//! tries each candidate sequentially and returns the first success.
//! Sequential iteration is deliberate: it bounds resource usage and
//! keeps failure attribution to one mirror attempt at a time.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::{MounterConfig, SyncConfig};
use crate::extract::TarExtractor;
use crate::registry::OciRegistryClient;
use crate::sync::{SyncEngine, SyncError};

/// Errors from mounting an image across its mirrors.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("could not resolve mirrored names for {name}: {source}")]
    Resolution {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every candidate failed. Carries each per-mirror failure; nothing
    /// half-written by a failed candidate is surfaced to the caller.
    #[error("{}", exhausted_message(.attempts))]
    AllMirrorsExhausted { attempts: Vec<(String, SyncError)> },
}

fn exhausted_message(attempts: &[(String, SyncError)]) -> String {
    let details: Vec<String> = attempts
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect();
    format!(
        "all {} mirrors tried: [{}]",
        attempts.len(),
        details.join("; ")
    )
}

/// Supplies the ordered list of equivalent names for an image.
///
/// The list's ordering and contents are entirely the resolver's
/// responsibility; it need not literally contain the input name.
pub trait MirrorResolver: Send + Sync {
    fn resolve(&self, name: &str) -> anyhow::Result<Vec<String>>;
}

/// Resolver backed by a fixed candidate list, for deployments with a
/// statically configured mirror set (and for tests).
#[derive(Debug, Clone)]
pub struct StaticMirrorResolver {
    mirrors: Vec<String>,
}

impl StaticMirrorResolver {
    pub fn new(mirrors: Vec<String>) -> Self {
        Self { mirrors }
    }
}

impl MirrorResolver for StaticMirrorResolver {
    fn resolve(&self, _name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.mirrors.clone())
    }
}

/// The crate's entry point: resolves mirrors for an image and syncs the
/// first one that works, returning the extracted filesystem path.
pub struct RemoteImageMounter {
    resolver: Arc<dyn MirrorResolver>,
    engine: SyncEngine,
}

impl RemoteImageMounter {
    /// Build a mounter over the production registry client and tar
    /// extractor, caching under `config.base_dir`.
    pub fn new(config: MounterConfig, resolver: Arc<dyn MirrorResolver>) -> Self {
        let cache = CacheStore::new(config.base_dir.clone());
        let registry = Arc::new(OciRegistryClient::new(config));
        let engine = SyncEngine::new(cache, registry, Arc::new(TarExtractor::new()));
        Self { resolver, engine }
    }

    /// Build a mounter over injected capabilities.
    pub fn with_engine(resolver: Arc<dyn MirrorResolver>, engine: SyncEngine) -> Self {
        Self { resolver, engine }
    }

    /// Mount `name` (or one of its mirrors) and return the local
    /// filesystem path. Fails only once every candidate has failed.
    ///
    /// Concurrent calls for the same image name must be serialized by
    /// the caller; see [`SyncEngine::sync`].
    pub async fn mount_image(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &SyncConfig,
    ) -> Result<PathBuf, MountError> {
        let candidates = self
            .resolver
            .resolve(name)
            .map_err(|e| MountError::Resolution {
                name: name.to_string(),
                source: e,
            })?;

        let mut attempts = Vec::new();

        for candidate in candidates {
            info!(image = %candidate, "Pulling and mounting image");

            match self.engine.sync(cancel, &candidate, config).await {
                Ok(dir) => {
                    info!(image = %candidate, dir = %dir.display(), "Image pulled and mounted successfully");
                    return Ok(dir);
                }
                Err(e) => {
                    warn!(image = %candidate, error = %e, "Could not pull and mount image");
                    attempts.push((candidate, e));
                }
            }
        }

        Err(MountError::AllMirrorsExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenResolver;

    impl MirrorResolver for BrokenResolver {
        fn resolve(&self, name: &str) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("malformed image name {name:?}")
        }
    }

    #[test]
    fn test_static_resolver_returns_configured_list() {
        let resolver =
            StaticMirrorResolver::new(vec!["a:v1".to_string(), "mirror.io/a:v1".to_string()]);
        let mirrors = resolver.resolve("a:v1").unwrap();
        assert_eq!(mirrors, vec!["a:v1", "mirror.io/a:v1"]);
    }

    #[tokio::test]
    async fn test_resolution_failure_surfaces() {
        let mounter = RemoteImageMounter::new(
            MounterConfig {
                base_dir: std::env::temp_dir().join("imagesync-resolver-test"),
                ..Default::default()
            },
            Arc::new(BrokenResolver),
        );

        let err = mounter
            .mount_image(&CancellationToken::new(), "bad name", &SyncConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, MountError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_empty_mirror_list_is_exhausted() {
        let mounter = RemoteImageMounter::new(
            MounterConfig {
                base_dir: std::env::temp_dir().join("imagesync-empty-test"),
                ..Default::default()
            },
            Arc::new(StaticMirrorResolver::new(Vec::new())),
        );

        let err = mounter
            .mount_image(&CancellationToken::new(), "img:v1", &SyncConfig::default())
            .await
            .unwrap_err();

        match err {
            MountError::AllMirrorsExhausted { attempts } => assert!(attempts.is_empty()),
            other => panic!("expected exhaustion, got {other}"),
        }
    }
}
