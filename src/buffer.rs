//! Per-request blob spooling, in memory or on disk.
//!
//! Each filter request accumulates its payload into one [`BlobBuffer`]
//! before processing. The backing is chosen once per process from
//! `fastcdc.ondisk`: a plain vector, or an anonymous temp file inside the
//! repository's git dir. The temp file is unlinked at creation, so the
//! bytes are reclaimed on every exit path, panics and signals included.
//!
//! Buffers are write-once, read-many: fill with [`BlobBuffer::append`],
//! then stream with [`BlobBuffer::reader`] as often as needed.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

/// A single blob held either in RAM or in an unlinked temp file.
#[derive(Debug)]
pub struct BlobBuffer {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Memory(Vec<u8>),
    Disk { file: File, len: u64 },
}

impl BlobBuffer {
    /// A buffer backed by process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Inner::Memory(Vec::new()),
        }
    }

    /// A buffer backed by an anonymous temp file under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be created.
    pub fn on_disk(dir: &Path) -> Result<Self> {
        let file = tempfile::tempfile_in(dir)?;
        Ok(Self {
            inner: Inner::Disk { file, len: 0 },
        })
    }

    /// Append bytes to the end of the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.inner {
            Inner::Memory(vec) => vec.extend_from_slice(data),
            Inner::Disk { file, len } => {
                file.write_all(data)?;
                *len += data.len() as u64;
            }
        }
        Ok(())
    }

    /// Total bytes buffered.
    #[must_use]
    pub fn len(&self) -> u64 {
        match &self.inner {
            Inner::Memory(vec) => vec.len() as u64,
            Inner::Disk { len, .. } => *len,
        }
    }

    /// Whether the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader over the buffered bytes, positioned at the start.
    ///
    /// May be called repeatedly; each call restarts from the beginning.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be rewound.
    pub fn reader(&mut self) -> Result<BlobReader<'_>> {
        match &mut self.inner {
            Inner::Memory(vec) => Ok(BlobReader::Memory(Cursor::new(vec.as_slice()))),
            Inner::Disk { file, .. } => {
                file.seek(SeekFrom::Start(0))?;
                Ok(BlobReader::Disk(file))
            }
        }
    }

    /// Materialize the whole buffer.
    ///
    /// Callers with large payloads should prefer [`BlobBuffer::reader`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be read.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len()).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(len);
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Streaming reader over a [`BlobBuffer`].
#[derive(Debug)]
pub enum BlobReader<'a> {
    /// Reads straight from the vector backing.
    Memory(Cursor<&'a [u8]>),
    /// Reads from the rewound temp file.
    Disk(&'a mut File),
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::Disk(file) => file.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut BlobBuffer, pieces: &[&[u8]]) {
        for piece in pieces {
            buffer.append(piece).unwrap();
        }
    }

    fn exercise(mut buffer: BlobBuffer) {
        assert!(buffer.is_empty());
        fill(&mut buffer, &[b"hello ", b"", b"world"]);
        assert_eq!(buffer.len(), 11);
        assert!(!buffer.is_empty());

        assert_eq!(buffer.read_all().unwrap(), b"hello world");
        // Readers restart from the top every time.
        assert_eq!(buffer.read_all().unwrap(), b"hello world");

        let mut first = [0u8; 5];
        buffer.reader().unwrap().read_exact(&mut first).unwrap();
        assert_eq!(&first, b"hello");
    }

    #[test]
    fn memory_buffer_appends_and_rereads() {
        exercise(BlobBuffer::in_memory());
    }

    #[test]
    fn disk_buffer_appends_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        exercise(BlobBuffer::on_disk(dir.path()).unwrap());
    }

    #[test]
    fn disk_buffer_leaves_no_directory_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BlobBuffer::on_disk(dir.path()).unwrap();
        buffer.append(b"spooled").unwrap();

        // The temp file is anonymous: nothing to clean up even mid-use.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn both_backings_agree_on_large_payloads() {
        let data: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        let dir = tempfile::tempdir().unwrap();

        let mut memory = BlobBuffer::in_memory();
        let mut disk = BlobBuffer::on_disk(dir.path()).unwrap();
        for buffer in [&mut memory, &mut disk] {
            for part in data.chunks(65_516) {
                buffer.append(part).unwrap();
            }
        }

        assert_eq!(memory.len(), disk.len());
        assert_eq!(memory.read_all().unwrap(), disk.read_all().unwrap());
    }
}
