//! Filter settings read from the repository's configuration.
//!
//! Everything is keyed under `fastcdc.*` and read through the gateway so
//! the usual config stacking and `git config --type=int` suffix parsing
//! (`64k`, `1m`) apply. Values are fixed for the life of the process.

use crate::chunker::{ChunkerParams, AVG_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::error::{FilterError, Result};
use crate::gitcmd::Git;

/// Selects the disk-backed blob buffer.
pub const ONDISK_KEY: &str = "fastcdc.ondisk";

/// Overrides the minimum chunk size.
pub const MIN_KEY: &str = "fastcdc.min";

/// Overrides the target average chunk size.
pub const AVG_KEY: &str = "fastcdc.avg";

/// Overrides the maximum chunk size.
pub const MAX_KEY: &str = "fastcdc.max";

/// Per-process filter configuration.
#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    /// Spool request payloads to disk instead of RAM.
    pub ondisk: bool,
    /// Chunk-size parameters for the splitter.
    pub chunking: ChunkerParams,
}

impl FilterConfig {
    /// Load and validate the configuration of one repository.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] on out-of-range sizes and
    /// [`FilterError::Storage`] if git rejects a malformed value outright.
    pub fn load(git: &Git) -> Result<Self> {
        let ondisk = match git.config_get(ONDISK_KEY, Some("--type=bool"))? {
            Some(value) => value == "true",
            None => false,
        };
        let min = size_key(git, MIN_KEY, MIN_CHUNK_SIZE)?;
        let avg = size_key(git, AVG_KEY, AVG_CHUNK_SIZE)?;
        let max = size_key(git, MAX_KEY, MAX_CHUNK_SIZE)?;
        Ok(Self {
            ondisk,
            chunking: ChunkerParams::new(min, avg, max)?,
        })
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ondisk: false,
            chunking: ChunkerParams::default(),
        }
    }
}

fn size_key(git: &Git, key: &str, default: u32) -> Result<u32> {
    match git.config_get(key, Some("--type=int"))? {
        Some(text) => text
            .parse::<i64>()
            .ok()
            .and_then(|value| u32::try_from(value).ok())
            .ok_or_else(|| FilterError::InvalidConfig(format!("{key} = {text}"))),
        None => Ok(default),
    }
}
