//! # imagesync
//!
//! Synchronizes container images to local disk for consumers that need
//! the image's filesystem, not a running container. One call verifies
//! whether the cached extraction is still current against the remote
//! digest and, if not, streams the image's merged filesystem content
//! straight from the registry into a tar extractor, committing a digest
//! marker only after the extraction fully succeeds. Fallback across an
//! ordered list of mirror names is built in.
//!
//! ## Architecture
//!
//! ```text
//! RemoteImageMounter            (mirror fallback, the only entry point)
//! └── SyncEngine                (digest check, cache decision, streaming)
//!     ├── RegistryClient        (digest / pull / export capability)
//!     ├── CacheStore            (marker + fs tree per image name)
//!     └── Extractor             (byte stream -> directory tree)
//! ```
//!
//! The registry, extraction, and mirror-resolution capabilities are
//! traits with one production implementation and mock doubles, so the
//! engine is testable without a registry.
//!
//! ## Cache layout
//!
//! Per image name, under the configured base directory:
//! `<base>/<name>/digest` (marker) and `<base>/<name>/fs/` (extracted
//! tree). The layout is stable across restarts: a fresh entry stays
//! fresh as long as digests match.

pub mod cache;
pub mod config;
pub mod digest;
pub mod extract;
pub mod mirror;
pub mod registry;
pub mod sync;

// Re-export commonly used types
pub use cache::{CacheError, CacheStore, Freshness};
pub use config::{MounterConfig, SyncConfig};
pub use digest::{Digest, DigestError};
pub use extract::{ExtractError, Extractor, MockExtractor, TarExtractor};
pub use mirror::{MirrorResolver, MountError, RemoteImageMounter, StaticMirrorResolver};
pub use registry::{
    parse_image_ref, ImageHandle, MockImage, MockRegistryClient, OciRegistryClient,
    RegistryClient, RegistryError,
};
pub use sync::{SyncEngine, SyncError};
