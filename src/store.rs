//! Chunk persistence on the dedicated side branch.
//!
//! Chunks are ordinary blobs reachable from `refs/heads/git-fastcdc`,
//! filed under two-hex-character fan-out directories named by their own
//! digest. Writes batch up over a whole session and land as at most one
//! commit on session end; the `update-ref` compare-and-swap is the atomic
//! point, so a crash at any earlier moment leaves the ref untouched and at
//! worst some orphaned loose objects.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::error::{FilterError, Result};
use crate::gitcmd::{CatFileBatch, Git, RefUpdate, TreeEntry};
use crate::manifest::ChunkId;

/// The ref the chunk store commits to.
pub const CHUNK_REF: &str = "refs/heads/git-fastcdc";

enum CommitAttempt {
    Committed(String),
    Unchanged,
    Raced(String),
}

/// Session-scoped view of the chunk branch.
#[derive(Debug)]
pub struct ChunkStore {
    git: Git,
    batch: Option<CatFileBatch>,
    /// Digests reachable from the branch tip, loaded on first use.
    known: FxHashSet<String>,
    known_loaded: bool,
    /// Digests written this session that the tip does not yet hold.
    added: FxHashSet<String>,
}

impl ChunkStore {
    /// Bind a store to one repository.
    #[must_use]
    pub fn new(git: Git) -> Self {
        Self {
            git,
            batch: None,
            known: FxHashSet::default(),
            known_loaded: false,
            added: FxHashSet::default(),
        }
    }

    /// The underlying gateway.
    #[must_use]
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Write one chunk into the object database and index it for the
    /// session-end commit.
    ///
    /// Persisting a digest that is already reachable, or already persisted
    /// this session, changes nothing downstream.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the object write fails.
    pub fn persist(&mut self, data: &[u8]) -> Result<ChunkId> {
        let id = self.git.hash_object(data)?;
        self.ensure_known()?;
        if !self.known.contains(id.as_str()) {
            self.added.insert(id.as_str().to_string());
        }
        Ok(id)
    }

    /// Read one chunk back from the branch tip.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::MissingChunk`] if the digest is not
    /// reachable from [`CHUNK_REF`].
    pub fn retrieve(&mut self, id: &ChunkId) -> Result<Vec<u8>> {
        if self.batch.is_none() {
            self.batch = Some(self.git.cat_file_batch()?);
        }
        let batch = self.batch.as_mut().ok_or_else(|| {
            FilterError::Io(std::io::Error::other("cat-file reader unavailable"))
        })?;
        let spec = format!("{CHUNK_REF}:{}", id.branch_path());
        batch
            .read_object(&spec)?
            .ok_or_else(|| FilterError::MissingChunk(id.to_string()))
    }

    /// Whether the session has chunks awaiting the final commit.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.added.is_empty()
    }

    /// Record this session's chunks on the branch: zero or one commit.
    ///
    /// A lost compare-and-swap triggers exactly one re-read of the moved
    /// tip and a rebuild on top of it.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::RefContention`] if the swap also loses the
    /// retry, [`FilterError::Storage`] on plumbing failures.
    pub fn finalize(&mut self) -> Result<Option<String>> {
        if self.added.is_empty() {
            return Ok(None);
        }

        let outcome = match self.try_commit()? {
            CommitAttempt::Raced(detail) => {
                debug!(detail = %detail, "chunk branch moved, retrying commit");
                self.try_commit()?
            }
            outcome => outcome,
        };

        match outcome {
            CommitAttempt::Committed(tip) => {
                info!(chunks = self.added.len(), tip = %tip, "committed chunk batch");
                self.settle();
                Ok(Some(tip))
            }
            CommitAttempt::Unchanged => {
                // Someone else already landed every chunk we had.
                self.settle();
                Ok(None)
            }
            CommitAttempt::Raced(detail) => Err(FilterError::RefContention(detail)),
        }
    }

    fn settle(&mut self) {
        self.known.extend(self.added.drain());
    }

    fn ensure_known(&mut self) -> Result<()> {
        if self.known_loaded {
            return Ok(());
        }
        if let Some(tip) = self.git.rev_parse(CHUNK_REF)? {
            for entry in self.git.ls_tree_recursive(&tip)? {
                if entry.kind == "blob" {
                    self.known.insert(entry.oid);
                }
            }
        }
        self.known_loaded = true;
        Ok(())
    }

    /// One enumerate / mktree / commit-tree / update-ref pass.
    fn try_commit(&self) -> Result<CommitAttempt> {
        let old_tip = self.git.rev_parse(CHUNK_REF)?;

        // Current fan-out directories, by prefix name.
        let mut root: BTreeMap<String, TreeEntry> = BTreeMap::new();
        if let Some(tip) = &old_tip {
            for entry in self.git.ls_tree(tip)? {
                root.insert(entry.name.clone(), entry);
            }
        }

        let mut by_prefix: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for digest in &self.added {
            by_prefix.entry(&digest[..2]).or_default().push(digest);
        }

        // Rebuild only the directories that gained entries; everything
        // else is carried over by object id.
        for (prefix, digests) in by_prefix {
            let mut entries: BTreeMap<String, TreeEntry> = BTreeMap::new();
            if let Some(existing) = root.get(prefix) {
                for entry in self.git.ls_tree(&existing.oid)? {
                    entries.insert(entry.name.clone(), entry);
                }
            }
            for digest in digests {
                entries.insert(digest.to_string(), TreeEntry::blob(digest, digest));
            }
            let subtree: Vec<TreeEntry> = entries.into_values().collect();
            let oid = self.git.mktree(&subtree)?;
            root.insert(prefix.to_string(), TreeEntry::tree(oid, prefix));
        }

        let root_entries: Vec<TreeEntry> = root.into_values().collect();
        let new_tree = self.git.mktree(&root_entries)?;

        if let Some(tip) = &old_tip {
            let old_tree = self.git.rev_parse(&format!("{tip}^{{tree}}"))?;
            if old_tree.as_deref() == Some(new_tree.as_str()) {
                return Ok(CommitAttempt::Unchanged);
            }
        }

        let message = format!("fastcdc: add {} chunks", self.added.len());
        let commit = self
            .git
            .commit_tree(&new_tree, old_tip.as_deref(), &message)?;

        // The all-zero id asserts "ref must not exist" on first creation.
        let expected_old = match &old_tip {
            Some(tip) => tip.clone(),
            None => "0".repeat(commit.len()),
        };
        match self.git.update_ref_cas(CHUNK_REF, &commit, &expected_old)? {
            RefUpdate::Updated => Ok(CommitAttempt::Committed(commit)),
            RefUpdate::Refused(detail) => Ok(CommitAttempt::Raced(detail)),
        }
    }
}
