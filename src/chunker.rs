//! Content-defined chunking with the FastCDC rolling-hash predicate.
//!
//! Boundaries depend only on the bytes and the parameters, so identical
//! regions of different blobs split identically and deduplicate on the
//! chunk branch. Splitting is always streamed: memory stays bounded by
//! roughly the maximum chunk size no matter how the blob is buffered.

use std::io::Read;

use fastcdc::v2020::StreamCDC;

use crate::error::{FilterError, Result};

/// Default minimum chunk size (4 KiB).
pub const MIN_CHUNK_SIZE: u32 = 4096;

/// Default target average chunk size (64 KiB).
pub const AVG_CHUNK_SIZE: u32 = 65_536;

/// Default maximum chunk size (256 KiB).
pub const MAX_CHUNK_SIZE: u32 = 262_144;

/// Hard floors and ceilings of the FastCDC v2020 implementation.
const MIN_FLOOR: u32 = 64;
const AVG_FLOOR: u32 = 256;
const MAX_FLOOR: u32 = 1024;
const MAX_CEILING: u32 = 1_073_741_824;

/// Validated chunk-size parameters.
///
/// Parameters must stay fixed for the life of a repository, otherwise the
/// same bytes chunk differently and deduplication is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    min: u32,
    avg: u32,
    max: u32,
}

impl ChunkerParams {
    /// Validate a `min`/`avg`/`max` triple.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidConfig`] unless
    /// `64 <= min <= avg <= max`, `avg >= 256`, and
    /// `1024 <= max <= 1 GiB` (the bounds FastCDC itself enforces).
    pub fn new(min: u32, avg: u32, max: u32) -> Result<Self> {
        if min < MIN_FLOOR || avg < AVG_FLOOR || max < MAX_FLOOR || max > MAX_CEILING {
            return Err(FilterError::InvalidConfig(format!(
                "chunk sizes out of range: min={min} avg={avg} max={max}"
            )));
        }
        if !(min <= avg && avg <= max) {
            return Err(FilterError::InvalidConfig(format!(
                "chunk sizes must satisfy min <= avg <= max, got {min}/{avg}/{max}"
            )));
        }
        Ok(Self { min, avg, max })
    }

    /// The minimum chunk size in bytes.
    #[must_use]
    pub const fn min(&self) -> u32 {
        self.min
    }

    /// The target average chunk size in bytes.
    #[must_use]
    pub const fn avg(&self) -> u32 {
        self.avg
    }

    /// The maximum chunk size in bytes.
    #[must_use]
    pub const fn max(&self) -> u32 {
        self.max
    }
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min: MIN_CHUNK_SIZE,
            avg: AVG_CHUNK_SIZE,
            max: MAX_CHUNK_SIZE,
        }
    }
}

/// Splits byte streams into content-defined chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    params: ChunkerParams,
}

impl Chunker {
    /// Create a chunker with the given parameters.
    #[must_use]
    pub const fn new(params: ChunkerParams) -> Self {
        Self { params }
    }

    /// The parameters in effect.
    #[must_use]
    pub const fn params(&self) -> &ChunkerParams {
        &self.params
    }

    /// Split a byte source into chunks, streamed in order.
    ///
    /// Every chunk is in `[min, max]` bytes except the final one, which may
    /// be shorter than `min`; an empty source yields no chunks. The
    /// concatenation of the yielded chunks equals the source.
    pub fn split<R: Read>(&self, source: R) -> Chunks<R> {
        Chunks {
            inner: StreamCDC::new(source, self.params.min, self.params.avg, self.params.max),
        }
    }
}

/// Iterator over the chunks of one byte source.
pub struct Chunks<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.inner.next()?;
        Some(chunk.map(|data| data.data).map_err(map_cdc_error))
    }
}

fn map_cdc_error(err: fastcdc::v2020::Error) -> FilterError {
    match err {
        fastcdc::v2020::Error::IoError(e) => FilterError::Io(e),
        other => FilterError::Io(std::io::Error::other(other.to_string())),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Chunks always reassemble into the source.
        #[test]
        fn chunks_reassemble(data in proptest::collection::vec(any::<u8>(), 0..300_000)) {
            let chunker = Chunker::default();
            let chunks: Vec<Vec<u8>> = chunker
                .split(Cursor::new(data.clone()))
                .collect::<crate::error::Result<_>>()
                .unwrap();
            prop_assert_eq!(chunks.concat(), data);
        }
    }
}
