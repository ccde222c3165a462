//! Streaming sync engine for a single image.
//!
//! One sync call means: resolve the remote digest, decide freshness
//! against the cache marker, and if the cached copy cannot be used, pull
//! the image and stream its merged filesystem content through a bounded
//! channel into the extractor. The digest marker is committed strictly
//! after extraction succeeds and the call was not cancelled, so a crash
//! or cancellation at any point leaves the entry absent or stale, never
//! falsely fresh.
//!
//! Concurrent sync calls for the same image name are NOT serialized
//! here; callers that can race on a name must hold their own per-name
//! mutual exclusion, because two interleaved invalidate/prepare
//! sequences on one directory would corrupt each other.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheError, CacheStore, Freshness};
use crate::config::SyncConfig;
use crate::digest::Digest;
use crate::extract::{ExtractError, Extractor};
use crate::registry::{RegistryClient, RegistryError};

/// Capacity, in chunks, of the producer/consumer streaming channel.
/// Bounds memory use and gives the producer backpressure; the full
/// export is never buffered.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Errors from one sync attempt. Every failure aborts the attempt;
/// retries only happen at the mirror-fallback level.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not get the remote digest: {0}")]
    DigestLookup(#[source] RegistryError),

    #[error("cache store failure: {0}")]
    Cache(#[from] CacheError),

    #[error("could not pull the image: {0}")]
    Pull(#[source] RegistryError),

    /// Producer and/or consumer failed during streaming. Both sides are
    /// captured; neither shadows the other.
    #[error("{}", stream_failure(.producer, .consumer))]
    Stream {
        producer: Option<RegistryError>,
        consumer: Option<ExtractError>,
    },

    /// The call was cancelled after extraction but before the marker
    /// write. The extracted tree stays on disk as unverified content;
    /// the next call re-checks it by digest.
    #[error("cancelled, not writing digest marker")]
    CancelledBeforeCommit,

    #[error("pulled digest {actual} does not match the resolved digest {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },
}

fn stream_failure(producer: &Option<RegistryError>, consumer: &Option<ExtractError>) -> String {
    let mut parts = Vec::new();
    if let Some(e) = producer {
        parts.push(format!("export: {e}"));
    }
    if let Some(e) = consumer {
        parts.push(format!("extract: {e}"));
    }
    format!(
        "got one or more errors while writing the image: {}",
        parts.join("; ")
    )
}

/// Orchestrates one image sync: digest check, cache decision, concurrent
/// pull/extract, marker commit.
pub struct SyncEngine {
    cache: CacheStore,
    registry: Arc<dyn RegistryClient>,
    extractor: Arc<dyn Extractor>,
}

impl SyncEngine {
    pub fn new(
        cache: CacheStore,
        registry: Arc<dyn RegistryClient>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            cache,
            registry,
            extractor,
        }
    }

    /// Sync `name` to local disk and return the extracted filesystem
    /// path.
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &SyncConfig,
    ) -> Result<PathBuf, SyncError> {
        debug!(image = %name, "Getting digest");

        let remote_digest = race_cancel(cancel, self.registry.digest(name, config))
            .await
            .map_err(SyncError::DigestLookup)?;

        match self.cache.check_freshness(name, &remote_digest)? {
            Freshness::Fresh(path) => {
                info!(
                    image = %name,
                    digest = %remote_digest,
                    "Cached digest matches the remote digest; skipping pull"
                );
                return Ok(path);
            }
            Freshness::Stale => {
                info!(image = %name, "Cached digest and remote digest differ; pulling image");
            }
            Freshness::Absent => {
                info!(image = %name, "No cached copy; pulling image");
            }
        }

        self.cache.invalidate(name)?;
        let dest = self.cache.prepare_destination(name)?;

        debug!(image = %name, "Pulling image");

        let handle = race_cancel(cancel, self.registry.pull(name, config))
            .await
            .map_err(SyncError::Pull)?;

        // Producer and consumer run concurrently, joined by one bounded
        // channel. Either side failing drops its channel end, which
        // promptly unblocks the other.
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);

        let producer = {
            let handle = Arc::clone(&handle);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Completion wins over a simultaneous cancellation:
                // finished work is reported as finished, and the
                // pre-commit check still refuses to certify it.
                tokio::select! {
                    biased;
                    result = handle.export(tx) => result,
                    _ = cancel.cancelled() => Err(RegistryError::Cancelled),
                }
            })
        };

        let consumer = {
            let extractor = Arc::clone(&self.extractor);
            let dest = dest.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    result = extractor.extract(rx, &dest) => result,
                    _ = cancel.cancelled() => Err(ExtractError::Cancelled),
                }
            })
        };

        let (producer_result, consumer_result) = tokio::join!(producer, consumer);

        let producer_result = producer_result
            .unwrap_or_else(|e| Err(RegistryError::Export(format!("producer task failed: {e}"))));
        let consumer_result = consumer_result
            .unwrap_or_else(|e| Err(ExtractError::Task(format!("consumer task failed: {e}"))));

        if producer_result.is_err() || consumer_result.is_err() {
            return Err(SyncError::Stream {
                producer: producer_result.err(),
                consumer: consumer_result.err(),
            });
        }

        // The tree on disk may be complete, but if the caller gave up we
        // must not certify it. The next call re-verifies by digest.
        if cancel.is_cancelled() {
            return Err(SyncError::CancelledBeforeCommit);
        }

        debug!(image = %name, "Image written to the filesystem");

        let pulled_digest = handle.digest().await.map_err(SyncError::DigestLookup)?;
        if pulled_digest != remote_digest {
            return Err(SyncError::DigestMismatch {
                expected: remote_digest,
                actual: pulled_digest,
            });
        }

        self.cache.commit(name, &pulled_digest)?;

        info!(image = %name, digest = %pulled_digest, dir = %dest.display(), "Image synced");

        Ok(dest)
    }
}

/// Run `fut` unless `cancel` fires first.
async fn race_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, RegistryError> {
    tokio::select! {
        // An already-cancelled call must not start a network operation.
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::MockExtractor;
    use crate::registry::{MockImage, MockRegistryClient};
    use tempfile::TempDir;

    fn digest(s: &str) -> Digest {
        Digest::parse(s).unwrap()
    }

    fn engine(tmp: &TempDir, registry: MockRegistryClient) -> SyncEngine {
        SyncEngine::new(
            CacheStore::new(tmp.path()),
            Arc::new(registry),
            Arc::new(MockExtractor::new()),
        )
    }

    #[tokio::test]
    async fn test_digest_lookup_failure_mutates_nothing() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp, MockRegistryClient::new());
        let cancel = CancellationToken::new();

        let err = engine
            .sync(&cancel, "missing:latest", &SyncConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::DigestLookup(_)));
        assert!(!tmp.path().join("missing:latest").exists());
    }

    #[tokio::test]
    async fn test_sync_extracts_and_commits() {
        let tmp = TempDir::new().unwrap();
        let registry = MockRegistryClient::new()
            .with_image("img:v1", MockImage::new(digest("sha256:aa11"), &b"bytes"[..]));
        let engine = engine(&tmp, registry);
        let cancel = CancellationToken::new();

        let path = engine
            .sync(&cancel, "img:v1", &SyncConfig::default())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path.join("content")).unwrap(), b"bytes");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("img:v1/digest")).unwrap(),
            "sha256:aa11"
        );
    }

    #[tokio::test]
    async fn test_post_pull_digest_divergence_fails() {
        let tmp = TempDir::new().unwrap();
        let mut image = MockImage::new(digest("sha256:aa11"), &b"bytes"[..]);
        image.post_pull_digest = Some(digest("sha256:bb22"));
        let registry = MockRegistryClient::new().with_image("img:v1", image);
        let engine = engine(&tmp, registry);
        let cancel = CancellationToken::new();

        let err = engine
            .sync(&cancel, "img:v1", &SyncConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::DigestMismatch { .. }));
        assert!(!tmp.path().join("img:v1/digest").exists());
    }

    #[tokio::test]
    async fn test_case_divergent_post_pull_digest_commits() {
        let tmp = TempDir::new().unwrap();
        let mut image = MockImage::new(digest("sha256:aa11"), &b"bytes"[..]);
        image.post_pull_digest = Some(digest("SHA256:AA11"));
        let registry = MockRegistryClient::new().with_image("img:v1", image);
        let engine = engine(&tmp, registry);
        let cancel = CancellationToken::new();

        engine
            .sync(&cancel, "img:v1", &SyncConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled_call_fails() {
        let tmp = TempDir::new().unwrap();
        let registry = MockRegistryClient::new()
            .with_image("img:v1", MockImage::new(digest("sha256:aa11"), &b"bytes"[..]));
        let engine = engine(&tmp, registry);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .sync(&cancel, "img:v1", &SyncConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::DigestLookup(RegistryError::Cancelled)
        ));
    }
}
