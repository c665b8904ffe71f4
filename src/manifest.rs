//! The chunk manifest that replaces a filtered file in the main tree.
//!
//! A manifest is a line-oriented text blob: the literal magic `fastcdc` on
//! the first line, then one lowercase hex chunk digest per line, in the
//! order the chunker emitted them. Smudge rejects anything that does not
//! carry the magic, so unfiltered files can never be clobbered.

use std::fmt;

use crate::error::{FilterError, Result};

/// Magic first line of every manifest.
pub const MANIFEST_MAGIC: &str = "fastcdc";

/// A chunk digest as issued by the host's object database.
///
/// This is the full lowercase hex object id of the chunk blob: 40
/// characters for SHA-1 repositories, 64 for SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(String);

impl ChunkId {
    /// Validate and wrap a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidManifest`] unless the input is 40 or
    /// 64 lowercase hex characters.
    pub fn new(digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into();
        let valid_len = digest.len() == 40 || digest.len() == 64;
        let valid_chars = digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid_len || !valid_chars {
            return Err(FilterError::InvalidManifest(format!(
                "malformed digest {digest:?}"
            )));
        }
        Ok(Self(digest))
    }

    /// The digest as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-hex-character fan-out directory this chunk lives under on
    /// the chunk branch.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }

    /// The chunk's path relative to the chunk branch root, `<pp>/<digest>`.
    #[must_use]
    pub fn branch_path(&self) -> String {
        format!("{}/{}", self.prefix(), self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered list of chunk digests reconstructing one blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    digests: Vec<ChunkId>,
}

impl Manifest {
    /// Create an empty manifest (the clean of an empty blob).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next chunk digest.
    pub fn push(&mut self, digest: ChunkId) {
        self.digests.push(digest);
    }

    /// The digests in reconstruction order.
    #[must_use]
    pub fn digests(&self) -> &[ChunkId] {
        &self.digests
    }

    /// Whether the manifest describes an empty blob.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Serialize to the on-disk text form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(8 + self.digests.len() * 65);
        out.push_str(MANIFEST_MAGIC);
        out.push('\n');
        for digest in &self.digests {
            out.push_str(digest.as_str());
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse a manifest from smudge input.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidManifest`] if the input is not UTF-8,
    /// does not start with the magic line, or contains a malformed digest.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| FilterError::InvalidManifest("not a text blob".to_string()))?;

        let mut lines = text.split_inclusive('\n');
        match lines.next() {
            Some(line) if line == "fastcdc\n" => {}
            _ => {
                return Err(FilterError::InvalidManifest(
                    "missing magic header".to_string(),
                ))
            }
        }

        let mut manifest = Self::new();
        for line in lines {
            let digest = line.strip_suffix('\n').unwrap_or(line);
            manifest.push(ChunkId::new(digest)?);
        }
        Ok(manifest)
    }
}

impl FromIterator<ChunkId> for Manifest {
    fn from_iter<I: IntoIterator<Item = ChunkId>>(iter: I) -> Self {
        Self {
            digests: iter.into_iter().collect(),
        }
    }
}
