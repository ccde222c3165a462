//! Registry client capability: digest lookup, pull, and streaming export.
//!
//! The sync engine only sees the [`RegistryClient`] and [`ImageHandle`]
//! traits. The production implementation speaks enough of the OCI
//! Distribution Specification to resolve a manifest digest and stream
//! layer blobs; test doubles live at the bottom of this module.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::TryStreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{MounterConfig, SyncConfig};
use crate::digest::{Digest, DigestError};
use crate::extract::ChunkReader;

/// Chunk size for decompressed export bytes.
const EXPORT_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the compressed-bytes bridge between the HTTP stream and
/// the blocking decompressor.
const BRIDGE_CAPACITY: usize = 16;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("pull timeout")]
    Timeout,

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Registry client seam: digest lookup and image pull.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve the current content digest for `name`.
    async fn digest(&self, name: &str, config: &SyncConfig) -> Result<Digest, RegistryError>;

    /// Obtain a pullable handle for `name`.
    async fn pull(
        &self,
        name: &str,
        config: &SyncConfig,
    ) -> Result<Arc<dyn ImageHandle>, RegistryError>;
}

/// A pulled image, ready to export its merged filesystem content.
#[async_trait]
pub trait ImageHandle: Send + Sync {
    /// Write the image's merged filesystem content into `sink` as a tar
    /// byte stream. The write side closes when this returns (the caller
    /// drops its sender), on success or error alike.
    async fn export(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RegistryError>;

    /// The digest of the pulled content. May differ in string
    /// representation from the pre-pull lookup but must identify the
    /// same content.
    async fn digest(&self) -> Result<Digest, RegistryError>;
}

/// Parse an image reference into registry, repository, and reference
/// (tag or digest) components.
///
/// Examples:
/// - `alpine:latest` -> (registry-1.docker.io, library/alpine, latest)
/// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
/// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
pub fn parse_image_ref(image_ref: &str) -> Result<(String, String, String), RegistryError> {
    if image_ref.is_empty() {
        return Err(RegistryError::InvalidReference(image_ref.to_string()));
    }

    let (name_part, reference) = if let Some((name, digest)) = image_ref.rsplit_once('@') {
        (name, digest.to_string())
    } else if let Some((name, tag)) = image_ref.rsplit_once(':') {
        if tag.contains('/') {
            // It's a port, not a tag
            (image_ref, "latest".to_string())
        } else {
            (name, tag.to_string())
        }
    } else {
        (image_ref, "latest".to_string())
    };

    let parts: Vec<&str> = name_part.splitn(2, '/').collect();
    let (registry, repo) = if parts.len() == 1 {
        // No slash - Docker Hub library image
        (
            "registry-1.docker.io".to_string(),
            format!("library/{}", parts[0]),
        )
    } else if parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost" {
        (parts[0].to_string(), parts[1].to_string())
    } else {
        ("registry-1.docker.io".to_string(), name_part.to_string())
    };

    Ok((registry, repo, reference))
}

/// OCI image manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Content descriptor.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Descriptor {
    fn is_gzip(&self) -> bool {
        self.media_type.ends_with("gzip")
    }
}

/// Production registry client over the OCI distribution HTTP API.
pub struct OciRegistryClient {
    config: MounterConfig,
}

impl OciRegistryClient {
    pub fn new(config: MounterConfig) -> Self {
        Self { config }
    }

    /// Build an HTTP client honoring the per-call TLS policy.
    fn http_client(&self, sync: &SyncConfig) -> Result<Client, RegistryError> {
        if sync.insecure_pull {
            warn!("Pulling without TLS verification");
        }

        let client = Client::builder()
            .timeout(self.config.total_timeout)
            .danger_accept_invalid_certs(sync.insecure_pull)
            .build()?;

        Ok(client)
    }

    fn authorized(request: RequestBuilder, sync: &SyncConfig) -> RequestBuilder {
        match &sync.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn fetch_manifest(
        &self,
        name: &str,
        sync: &SyncConfig,
    ) -> Result<(Bytes, Digest), RegistryError> {
        let (registry, repo, reference) = parse_image_ref(name)?;
        let client = self.http_client(sync)?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            registry_base_url(&registry),
            repo,
            reference
        );

        debug!(url = %url, "Fetching manifest");

        let request = Self::authorized(client.get(&url), sync).header(
            "Accept",
            "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json",
        );

        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                Ok((body, Digest::parse(&computed)?))
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(name.to_string())),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn digest(&self, name: &str, config: &SyncConfig) -> Result<Digest, RegistryError> {
        let (registry, repo, reference) = parse_image_ref(name)?;
        let client = self.http_client(config)?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            registry_base_url(&registry),
            repo,
            reference
        );

        debug!(url = %url, "Getting digest");

        let request = Self::authorized(client.head(&url), config).header(
            "Accept",
            "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json",
        );

        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                if let Some(header) = response.headers().get("Docker-Content-Digest") {
                    let value = header
                        .to_str()
                        .map_err(|_| RegistryError::InvalidReference(name.to_string()))?;
                    return Ok(Digest::parse(value)?);
                }

                // Registry did not advertise the digest; fall back to
                // hashing the manifest body.
                let (_, digest) = self.fetch_manifest(name, config).await?;
                Ok(digest)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(name.to_string())),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }

    async fn pull(
        &self,
        name: &str,
        config: &SyncConfig,
    ) -> Result<Arc<dyn ImageHandle>, RegistryError> {
        let (registry, repo, _) = parse_image_ref(name)?;
        let (body, manifest_digest) = self.fetch_manifest(name, config).await?;
        let manifest: Manifest = serde_json::from_slice(&body)?;

        let total = manifest.total_layer_size();
        if total > self.config.max_compressed_size {
            return Err(RegistryError::TooLarge {
                size: total,
                limit: self.config.max_compressed_size,
            });
        }

        debug!(
            image = %name,
            layer_count = manifest.layers.len(),
            total_compressed_bytes = total,
            "Manifest fetched"
        );

        Ok(Arc::new(OciImageHandle {
            client: self.http_client(config)?,
            base_url: registry_base_url(&registry),
            repo,
            manifest,
            digest: manifest_digest,
            sync: config.clone(),
            layer_timeout: self.config.layer_timeout,
        }))
    }
}

fn registry_base_url(registry: &str) -> String {
    if registry.starts_with("http://") || registry.starts_with("https://") {
        return registry.to_string();
    }

    // Loopback registries speak plain HTTP. Insecure pulls elsewhere keep
    // HTTPS; the client skips certificate verification instead.
    if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
        format!("http://{registry}")
    } else {
        format!("https://{registry}")
    }
}

/// A pulled OCI image: a parsed manifest plus the client to stream its
/// layer blobs.
struct OciImageHandle {
    client: Client,
    base_url: String,
    repo: String,
    manifest: Manifest,
    digest: Digest,
    sync: SyncConfig,
    layer_timeout: std::time::Duration,
}

impl OciImageHandle {
    /// Stream one layer blob into `sink`, decompressed, verifying the
    /// compressed bytes against the descriptor digest.
    async fn export_layer(
        &self,
        layer: &Descriptor,
        sink: &mpsc::Sender<Bytes>,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, self.repo, layer.digest);

        debug!(url = %url, size = layer.size, "Exporting layer");

        let request = OciRegistryClient::authorized(self.client.get(&url), &self.sync);
        let response = tokio::time::timeout(self.layer_timeout, request.send())
            .await
            .map_err(|_| RegistryError::Timeout)??;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(RegistryError::NotFound(layer.digest.clone())),
            StatusCode::UNAUTHORIZED => return Err(RegistryError::AuthRequired),
            _ => return Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }

        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();

        if layer.is_gzip() {
            // Compressed chunks cross to a blocking thread where flate2
            // inflates them; decompressed chunks continue into the sink.
            let (bridge_tx, bridge_rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
            let out = sink.clone();

            let inflate = tokio::task::spawn_blocking(move || -> Result<(), RegistryError> {
                let mut decoder = GzDecoder::new(ChunkReader::new(bridge_rx));
                let mut buf = vec![0u8; EXPORT_CHUNK_SIZE];
                loop {
                    let n = decoder.read(&mut buf)?;
                    if n == 0 {
                        return Ok(());
                    }
                    if out.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        return Err(RegistryError::Export(
                            "extraction side closed the stream".to_string(),
                        ));
                    }
                }
            });

            while let Some(chunk) = stream.try_next().await? {
                hasher.update(&chunk);
                if bridge_tx.send(chunk).await.is_err() {
                    // Decompressor bailed; its error is joined below.
                    break;
                }
            }
            drop(bridge_tx);

            inflate
                .await
                .map_err(|e| RegistryError::Export(e.to_string()))??;
        } else {
            while let Some(chunk) = stream.try_next().await? {
                hasher.update(&chunk);
                if sink.send(chunk).await.is_err() {
                    return Err(RegistryError::Export(
                        "extraction side closed the stream".to_string(),
                    ));
                }
            }
        }

        verify_layer_digest(&layer.digest, hasher)?;
        Ok(())
    }
}

#[async_trait]
impl ImageHandle for OciImageHandle {
    async fn export(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RegistryError> {
        debug!(image = %self.repo, "Starting to export image");

        for layer in &self.manifest.layers {
            self.export_layer(layer, &sink).await?;
        }

        debug!(image = %self.repo, "Done exporting image");
        Ok(())
    }

    async fn digest(&self) -> Result<Digest, RegistryError> {
        Ok(self.digest.clone())
    }
}

/// Verify downloaded compressed bytes against the descriptor digest.
/// Only sha256 descriptors are checkable; others are let through.
fn verify_layer_digest(expected: &str, hasher: Sha256) -> Result<(), RegistryError> {
    let expected_digest = Digest::parse(expected)?;
    if !expected.to_ascii_lowercase().starts_with("sha256:") {
        debug!(digest = %expected, "Skipping verification of non-sha256 layer");
        return Ok(());
    }

    let computed = Digest::parse(&format!("sha256:{}", hex::encode(hasher.finalize())))?;
    if computed != expected_digest {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual: computed.to_string(),
        });
    }

    Ok(())
}

/// A scripted image for the mock registry client.
#[derive(Debug, Clone)]
pub struct MockImage {
    /// Digest reported pre-pull and (unless overridden) post-pull.
    pub digest: Digest,
    /// Bytes exported for this image.
    pub content: Bytes,
    /// Fail the export immediately without sending anything.
    pub fail_export: bool,
    /// Post-pull digest override, for divergence scenarios.
    pub post_pull_digest: Option<Digest>,
}

impl MockImage {
    pub fn new(digest: Digest, content: impl Into<Bytes>) -> Self {
        Self {
            digest,
            content: content.into(),
            fail_export: false,
            post_pull_digest: None,
        }
    }
}

/// Mock registry for tests: a map of scripted images plus call counters.
#[derive(Debug, Default)]
pub struct MockRegistryClient {
    images: HashMap<String, MockImage>,
    digest_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl MockRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, name: &str, image: MockImage) -> Self {
        self.images.insert(name.to_string(), image);
        self
    }

    pub fn digest_calls(&self) -> usize {
        self.digest_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for MockRegistryClient {
    async fn digest(&self, name: &str, _config: &SyncConfig) -> Result<Digest, RegistryError> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(name)
            .map(|img| img.digest.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn pull(
        &self,
        name: &str,
        _config: &SyncConfig,
    ) -> Result<Arc<dyn ImageHandle>, RegistryError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(name)
            .map(|img| Arc::new(MockImageHandle(img.clone())) as Arc<dyn ImageHandle>)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

/// Handle over a scripted [`MockImage`].
pub struct MockImageHandle(MockImage);

#[async_trait]
impl ImageHandle for MockImageHandle {
    async fn export(&self, sink: mpsc::Sender<Bytes>) -> Result<(), RegistryError> {
        if self.0.fail_export {
            return Err(RegistryError::Export("mock export failure".to_string()));
        }

        for chunk in self.0.content.chunks(512) {
            if sink.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                return Err(RegistryError::Export(
                    "extraction side closed the stream".to_string(),
                ));
            }
        }

        Ok(())
    }

    async fn digest(&self) -> Result<Digest, RegistryError> {
        Ok(self
            .0
            .post_pull_digest
            .clone()
            .unwrap_or_else(|| self.0.digest.clone()))
    }
}
