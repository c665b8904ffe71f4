//! # git-fastcdc
//!
//! A long-running clean/smudge filter that swaps large binary files for
//! tiny manifests of content-defined chunks. Chunks are stored once as
//! ordinary blobs on a dedicated branch (`refs/heads/git-fastcdc`) and
//! deduplicate across revisions of files that delta poorly, like audio
//! libraries or disk images.
//!
//! ## How it fits together
//!
//! - **Clean**: git streams a file in over the pkt-line filter protocol;
//!   the bytes are spooled into a [`BlobBuffer`], split by the FastCDC
//!   [`Chunker`], persisted through the [`ChunkStore`], and answered with
//!   a [`Manifest`] listing the chunk digests in order.
//! - **Smudge**: the manifest comes back in, each digest is fetched from
//!   the chunk branch, and the original bytes stream back out.
//! - One [`FilterDriver`] session serves every file of a `git add` or
//!   checkout; chunk writes batch into at most one commit on the branch,
//!   landed with a compare-and-swap at session end.
//!
//! The chunk branch must be pushed and fetched alongside the history that
//! references it; this crate never touches remotes.
//!
//! ## Example
//!
//! ```no_run
//! use git_fastcdc::{ChunkStore, FilterConfig, FilterDriver, Git};
//!
//! let git = Git::discover()?;
//! let config = FilterConfig::load(&git)?;
//! let store = ChunkStore::new(git);
//! let driver = FilterDriver::new(
//!     std::io::stdin().lock(),
//!     std::io::stdout().lock(),
//!     store,
//!     config,
//! );
//! driver.run()?;
//! # Ok::<(), git_fastcdc::FilterError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod buffer;
mod chunker;
mod config;
mod driver;
mod error;
mod gitcmd;
mod manifest;
mod pktline;
mod store;

pub use buffer::{BlobBuffer, BlobReader};
pub use chunker::{
    Chunker, ChunkerParams, Chunks, AVG_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use config::{FilterConfig, AVG_KEY, MAX_KEY, MIN_KEY, ONDISK_KEY};
pub use driver::FilterDriver;
pub use error::{FilterError, Result};
pub use gitcmd::{CatFileBatch, Git, RefUpdate, TreeEntry, COMMIT_IDENT};
pub use manifest::{ChunkId, Manifest, MANIFEST_MAGIC};
pub use pktline::{Packet, PktReader, PktWriter, MAX_PKT_PAYLOAD};
pub use store::{ChunkStore, CHUNK_REF};
