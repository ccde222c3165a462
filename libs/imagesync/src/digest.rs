//! Content digest identifiers.
//!
//! A digest is the canonical `algo:hex` identifier for image content
//! (e.g. `sha256:a3ed95...`). Two digests identify the same content iff
//! they are equal under [`Digest`]'s equality, which compares both the
//! algorithm and the hex payload case-insensitively. Registries are not
//! consistent about hex casing between the pre-pull lookup and the digest
//! reported for a pulled image, so equality here is content equivalence,
//! not byte equality of the strings.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from digest parsing.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("digest {0:?} is missing the `algo:hex` separator")]
    MissingSeparator(String),

    #[error("digest {0:?} has an empty algorithm")]
    EmptyAlgorithm(String),

    #[error("digest {0:?} has a non-hex payload")]
    InvalidHex(String),
}

/// A content-derived image identifier in `algo:hex` form.
///
/// The original string representation is preserved for display and for
/// writing cache markers; equality and hashing are case-insensitive.
#[derive(Debug, Clone)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_string()))?;

        if algo.is_empty() {
            return Err(DigestError::EmptyAlgorithm(s.to_string()));
        }

        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidHex(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// The digest as originally written.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Digest {}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let d = Digest::parse("sha256:a3ed95caeb02").unwrap();
        assert_eq!(d.as_str(), "sha256:a3ed95caeb02");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("sha256").is_err());
        assert!(Digest::parse(":abcdef").is_err());
        assert!(Digest::parse("sha256:").is_err());
        assert!(Digest::parse("sha256:not-hex!").is_err());
    }

    #[test]
    fn test_content_equivalence_ignores_case() {
        let a = Digest::parse("sha256:ABCDEF012345").unwrap();
        let b = Digest::parse("SHA256:abcdef012345").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_content_not_equal() {
        let a = Digest::parse("sha256:abcdef012345").unwrap();
        let b = Digest::parse("sha256:abcdef012346").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_roundtrip_display() {
        let d: Digest = "sha256:00ff".parse().unwrap();
        assert_eq!(d.to_string(), "sha256:00ff");
    }
}
