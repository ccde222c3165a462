//! Configuration for the image mounter.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Per-call sync parameters, supplied by the surrounding controller and
/// immutable for the duration of one sync.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Pull without TLS verification. Logged loudly when set.
    pub insecure_pull: bool,

    /// Opaque registry credential, passed through to the registry client
    /// untouched.
    pub auth_token: Option<String>,
}

/// Process-level configuration for the mounter.
#[derive(Debug, Clone)]
pub struct MounterConfig {
    /// Base directory under which per-image cache entries live.
    pub base_dir: PathBuf,

    /// Maximum total compressed layer size accepted for a pull.
    pub max_compressed_size: u64,

    /// Per-blob pull timeout.
    pub layer_timeout: Duration,

    /// Overall HTTP client timeout.
    pub total_timeout: Duration,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/imagesync/images"),
            max_compressed_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            layer_timeout: Duration::from_secs(300),      // 5 minutes
            total_timeout: Duration::from_secs(1800),     // 30 minutes
        }
    }
}

impl MounterConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let base_dir = std::env::var("IMAGESYNC_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir);

        let max_compressed_size = std::env::var("IMAGESYNC_MAX_COMPRESSED_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_compressed_size);

        let layer_timeout = std::env::var("IMAGESYNC_LAYER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.layer_timeout);

        let total_timeout = std::env::var("IMAGESYNC_TOTAL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.total_timeout);

        Ok(Self {
            base_dir,
            max_compressed_size,
            layer_timeout,
            total_timeout,
        })
    }
}
