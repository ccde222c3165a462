//! On-disk cache of extracted images, keyed by image name.
//!
//! Each entry lives under `<base>/<image name>/` and holds exactly two
//! things: a `digest` marker file with the digest of the last fully
//! extracted image, and an `fs/` subtree with the extraction itself.
//! The marker is only ever written after a complete extraction, so a
//! readable marker implies a matching, complete `fs/` tree. Anything
//! that could break that pairing removes the whole entry first.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::digest::Digest;

/// Errors from cache store operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The digest marker exists but could not be read. This is never
    /// downgraded to "stale": a permissions or corruption problem has to
    /// surface instead of triggering a silent re-pull.
    #[error("could not read the digest marker {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The old entry could not be removed. Fatal for the sync attempt;
    /// extracting over an indeterminate old state is never allowed.
    #[error("could not remove the cache entry {path}: {source}")]
    Invalidate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not create the filesystem directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write the digest marker {path}: {source}")]
    MarkerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a freshness check against the remote digest.
#[derive(Debug)]
pub enum Freshness {
    /// The cached extraction matches the remote digest; the path is the
    /// ready `fs/` directory.
    Fresh(PathBuf),
    /// A marker exists but records different content.
    Stale,
    /// No marker exists for this name.
    Absent,
}

/// Owns the cache directory tree. Callers receive paths into entries the
/// store guarantees stable until the next sync call for the same name.
#[derive(Debug, Clone)]
pub struct CacheStore {
    base_dir: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `base_dir`. The directory itself is
    /// created lazily by the first `prepare_destination`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding the marker and filesystem tree for `name`.
    pub fn entry_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Path of the digest marker file for `name`.
    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.entry_dir(name).join("digest")
    }

    /// Path of the extracted filesystem root for `name`.
    pub fn fs_dir(&self, name: &str) -> PathBuf {
        self.entry_dir(name).join("fs")
    }

    /// Compare the recorded marker for `name` against `remote`.
    ///
    /// A missing marker is `Absent`. Any other read failure is an error.
    /// The comparison is content equivalence, so a marker written from a
    /// differently-cased digest string still counts as fresh.
    pub fn check_freshness(&self, name: &str, remote: &Digest) -> Result<Freshness, CacheError> {
        let marker = self.marker_path(name);

        debug!(path = %marker.display(), "Reading digest marker");

        let recorded = match fs::read_to_string(&marker) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Freshness::Absent),
            Err(e) => {
                return Err(CacheError::Read {
                    path: marker,
                    source: e,
                })
            }
        };

        debug!(
            recorded = %recorded,
            remote = %remote,
            "Comparing digests"
        );

        // A corrupt marker cannot equal any valid digest; treat it as stale
        // so the next sync replaces the entry wholesale.
        let fresh = Digest::parse(recorded.trim())
            .map(|d| d == *remote)
            .unwrap_or(false);

        if fresh {
            Ok(Freshness::Fresh(self.fs_dir(name)))
        } else {
            Ok(Freshness::Stale)
        }
    }

    /// Recursively remove the entry for `name`. Idempotent when the entry
    /// is already absent.
    pub fn invalidate(&self, name: &str) -> Result<(), CacheError> {
        let dir = self.entry_dir(name);

        info!(path = %dir.display(), "Removing cache entry");

        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Invalidate {
                path: dir,
                source: e,
            }),
        }
    }

    /// (Re)create the filesystem directory for `name` and return it.
    pub fn prepare_destination(&self, name: &str) -> Result<PathBuf, CacheError> {
        let fs_dir = self.fs_dir(name);

        fs::create_dir_all(&fs_dir).map_err(|e| CacheError::Prepare {
            path: fs_dir.clone(),
            source: e,
        })?;

        Ok(fs_dir)
    }

    /// Record `digest` as the marker for `name`.
    ///
    /// Must only be called once the extraction under `fs/` is known-good;
    /// the sync engine enforces that ordering. A crash before this write
    /// leaves the entry absent or stale, never falsely fresh.
    pub fn commit(&self, name: &str, digest: &Digest) -> Result<(), CacheError> {
        let marker = self.marker_path(name);

        debug!(path = %marker.display(), digest = %digest, "Writing digest marker");

        fs::write(&marker, digest.as_str()).map_err(|e| CacheError::MarkerWrite {
            path: marker,
            source: e,
        })
    }
}
