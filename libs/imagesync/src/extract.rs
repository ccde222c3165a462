//! Archive extraction capability.
//!
//! The sync engine hands the extractor the read side of the streaming
//! channel; the extractor materializes the tar entries under a destination
//! directory. The production implementation runs the `tar` crate on a
//! blocking thread, reading chunks off the channel through a small
//! `Read` bridge, so extraction of a byte begins only after that byte
//! was produced and backpressure propagates to the producer.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tar::Archive;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors from extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive entry {path} escapes the destination directory")]
    PathEscape { path: PathBuf },

    #[error("extraction task failed: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Archive extraction seam.
///
/// Dropping the receiver on failure is part of the contract: it is what
/// unblocks a producer stuck on a full channel.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Materialize the byte stream as a directory tree under `dest`,
    /// owned by the current execution principal. An empty stream is a
    /// valid, trivially successful extraction.
    async fn extract(&self, stream: mpsc::Receiver<Bytes>, dest: &Path)
        -> Result<(), ExtractError>;
}

/// Blocking `Read` adapter over the streaming channel.
///
/// Only valid on a blocking thread; `blocking_recv` panics inside an
/// async context.
pub(crate) struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                // Channel closed: producer finished or failed. Either way
                // this is end-of-stream; the engine joins the errors.
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Production extractor unpacking the merged layer stream with the `tar`
/// crate.
///
/// Layer archives arrive back-to-back on the stream; `ignore_zeros` lets
/// one `Archive` walk across the per-layer end-of-archive blocks. OCI
/// whiteout entries are applied (they delete content introduced by an
/// earlier layer) instead of being written out as files.
#[derive(Debug, Default)]
pub struct TarExtractor;

impl TarExtractor {
    pub fn new() -> Self {
        Self
    }

    fn unpack(stream: mpsc::Receiver<Bytes>, dest: &Path) -> Result<(), ExtractError> {
        let mut archive = Archive::new(ChunkReader::new(stream));
        archive.set_ignore_zeros(true);
        archive.set_preserve_permissions(true);
        // Entries become owned by whoever runs this process; archive
        // ownership metadata is not applied.
        archive.set_preserve_ownerships(false);

        let mut entries = 0usize;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            if let Some(target) = file_name.strip_prefix(".wh.") {
                apply_whiteout(dest, &path, target)?;
                continue;
            }

            if !entry.unpack_in(dest)? {
                return Err(ExtractError::PathEscape { path });
            }

            entries += 1;
        }

        debug!(
            dest = %dest.display(),
            entries,
            "Done writing tar archive"
        );

        Ok(())
    }
}

#[async_trait]
impl Extractor for TarExtractor {
    async fn extract(
        &self,
        stream: mpsc::Receiver<Bytes>,
        dest: &Path,
    ) -> Result<(), ExtractError> {
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || Self::unpack(stream, &dest))
            .await
            .map_err(|e| ExtractError::Task(e.to_string()))?
    }
}

/// Apply an OCI whiteout entry: `.wh.<name>` removes `<name>` from the
/// merged tree, `.wh..wh..opq` empties the containing directory.
fn apply_whiteout(dest: &Path, entry_path: &Path, target: &str) -> Result<(), ExtractError> {
    let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));

    // Whiteouts bypass unpack_in, so they get their own escape check.
    if parent
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ExtractError::PathEscape {
            path: entry_path.to_path_buf(),
        });
    }

    let dir = dest.join(parent);

    if target == ".wh..opq" {
        // Opaque whiteout: drop everything the lower layers put here.
        if dir.is_dir() {
            for child in fs::read_dir(&dir)? {
                let child = child?.path();
                if child.is_dir() {
                    fs::remove_dir_all(&child)?;
                } else {
                    fs::remove_file(&child)?;
                }
            }
        }
        return Ok(());
    }

    let victim = dir.join(target);
    let removed = if victim.is_dir() {
        fs::remove_dir_all(&victim)
    } else {
        fs::remove_file(&victim)
    };

    match removed {
        Ok(()) => Ok(()),
        // Nothing to delete: the lower layer never produced it.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Mock extractor for tests.
///
/// On success it concatenates the stream into a `content` file under the
/// destination, which is enough for callers to assert that the right
/// bytes arrived. On failure it returns immediately, dropping the
/// receiver without draining it.
#[derive(Debug, Default)]
pub struct MockExtractor {
    fail: bool,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self { fail: false }
    }

    /// A mock that fails without reading any of the stream.
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        mut stream: mpsc::Receiver<Bytes>,
        dest: &Path,
    ) -> Result<(), ExtractError> {
        if self.fail {
            warn!("[MOCK] Extractor configured to fail");
            return Err(ExtractError::Task("mock extractor failure".to_string()));
        }

        let mut content = Vec::new();
        while let Some(chunk) = stream.recv().await {
            content.extend_from_slice(&chunk);
        }

        fs::write(dest.join("content"), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a tar archive in memory from (path, contents) pairs.
    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    async fn extract_bytes(archives: Vec<Vec<u8>>, dest: &Path) -> Result<(), ExtractError> {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for archive in archives {
                for chunk in archive.chunks(512) {
                    if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        });

        let result = TarExtractor::new().extract(rx, dest).await;
        producer.await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_extracts_entries() {
        let tmp = TempDir::new().unwrap();
        let archive = build_tar(&[("etc/motd", b"hello"), ("usr/bin/tool", b"\x7fELF")]);

        extract_bytes(vec![archive], tmp.path()).await.unwrap();

        assert_eq!(fs::read(tmp.path().join("etc/motd")).unwrap(), b"hello");
        assert_eq!(fs::read(tmp.path().join("usr/bin/tool")).unwrap(), b"\x7fELF");
    }

    #[tokio::test]
    async fn test_empty_stream_is_valid() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        drop(tx);

        TarExtractor::new().extract(rx, tmp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_concatenated_layers_merge() {
        let tmp = TempDir::new().unwrap();
        let lower = build_tar(&[("app/config", b"v1"), ("app/old", b"old")]);
        let upper = build_tar(&[("app/config", b"v2")]);

        extract_bytes(vec![lower, upper], tmp.path()).await.unwrap();

        assert_eq!(fs::read(tmp.path().join("app/config")).unwrap(), b"v2");
        assert_eq!(fs::read(tmp.path().join("app/old")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_whiteout_removes_lower_file() {
        let tmp = TempDir::new().unwrap();
        let lower = build_tar(&[("app/stale", b"bye"), ("app/kept", b"hi")]);
        let upper = build_tar(&[("app/.wh.stale", b"")]);

        extract_bytes(vec![lower, upper], tmp.path()).await.unwrap();

        assert!(!tmp.path().join("app/stale").exists());
        assert_eq!(fs::read(tmp.path().join("app/kept")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_opaque_whiteout_clears_directory() {
        let tmp = TempDir::new().unwrap();
        let lower = build_tar(&[("app/a", b"a"), ("app/b", b"b")]);
        let upper = build_tar(&[("app/.wh..wh..opq", b""), ("app/c", b"c")]);

        extract_bytes(vec![lower, upper], tmp.path()).await.unwrap();

        assert!(!tmp.path().join("app/a").exists());
        assert!(!tmp.path().join("app/b").exists());
        assert_eq!(fs::read(tmp.path().join("app/c")).unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_escaping_whiteout_rejected() {
        let tmp = TempDir::new().unwrap();

        // The builder API refuses `..` components, so write the name into
        // the header bytes directly, the way a hostile archive would carry
        // it.
        let mut header = tar::Header::new_gnu();
        let name = b"../.wh.escape";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();

        let mut archive = header.as_bytes().to_vec();
        archive.extend_from_slice(&[0u8; 1024]);

        let err = extract_bytes(vec![archive], tmp.path()).await.unwrap_err();
        assert!(matches!(err, ExtractError::PathEscape { .. }));
    }
}
