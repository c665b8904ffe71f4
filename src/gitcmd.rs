//! Thin subprocess gateway to the host repository's plumbing.
//!
//! Every operation shells out to `git` with binary pipes and captured
//! stderr; non-zero exits surface as [`FilterError::Storage`] except where
//! git uses an exit code to mean "absent" (unset config keys, unknown
//! refs, a refused ref update). The smudge hot path keeps one
//! `cat-file --batch` child alive for the whole session instead of paying
//! a process spawn per chunk.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Output, Stdio};

use tracing::debug;

use crate::error::{FilterError, Result};
use crate::manifest::ChunkId;

/// Fixed identity recorded on every chunk-branch commit.
pub const COMMIT_IDENT: (&str, &str) = ("git-fastcdc", "git-fastcdc@localhost");

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Octal mode string, `100644` for blobs and `040000` for subtrees.
    pub mode: String,
    /// Object type, `blob` or `tree`.
    pub kind: String,
    /// Hex object id.
    pub oid: String,
    /// Entry name, or full path when listed recursively.
    pub name: String,
}

impl TreeEntry {
    /// A regular-file blob entry.
    #[must_use]
    pub fn blob(oid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: "100644".to_string(),
            kind: "blob".to_string(),
            oid: oid.into(),
            name: name.into(),
        }
    }

    /// A subtree entry.
    #[must_use]
    pub fn tree(oid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: "040000".to_string(),
            kind: "tree".to_string(),
            oid: oid.into(),
            name: name.into(),
        }
    }

    /// The `mktree` input line for this entry, without the newline.
    #[must_use]
    pub fn format(&self) -> String {
        format!("{} {} {}\t{}", self.mode, self.kind, self.oid, self.name)
    }

    fn parse(line: &str) -> Result<Self> {
        let (meta, name) = line.split_once('\t').ok_or_else(|| FilterError::Storage {
            command: "ls-tree".to_string(),
            detail: format!("unparsable entry {line:?}"),
        })?;
        let mut fields = meta.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(mode), Some(kind), Some(oid)) => Ok(Self {
                mode: mode.to_string(),
                kind: kind.to_string(),
                oid: oid.to_string(),
                name: name.to_string(),
            }),
            _ => Err(FilterError::Storage {
                command: "ls-tree".to_string(),
                detail: format!("unparsable entry {line:?}"),
            }),
        }
    }
}

/// Outcome of a compare-and-swap ref update.
#[derive(Debug)]
pub enum RefUpdate {
    /// The ref now points at the new value.
    Updated,
    /// git refused the update; carries its stderr.
    Refused(String),
}

/// Handle on one repository, addressed through plumbing subprocesses.
#[derive(Debug)]
pub struct Git {
    work_dir: PathBuf,
    git_dir: PathBuf,
}

impl Git {
    /// Open the repository containing `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if `dir` is not inside a work tree.
    pub fn open(dir: &Path) -> Result<Self> {
        let toplevel = run_in(dir, &["rev-parse", "--show-toplevel"], None)?;
        let work_dir = PathBuf::from(stdout_line(&toplevel, "rev-parse")?);
        let git_dir_out = run_in(&work_dir, &["rev-parse", "--absolute-git-dir"], None)?;
        let git_dir = PathBuf::from(stdout_line(&git_dir_out, "rev-parse")?);
        Ok(Self { work_dir, git_dir })
    }

    /// Open the repository containing the current working directory.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] outside a work tree.
    pub fn discover() -> Result<Self> {
        Self::open(Path::new("."))
    }

    /// The repository's work-tree root.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The repository's git dir; temp files belong here, next to the
    /// object store they feed.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Write a blob into the object database, returning its id.
    ///
    /// Writing an already-present blob is a no-op inside git.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the plumbing call fails.
    pub fn hash_object(&self, data: &[u8]) -> Result<ChunkId> {
        let out = self.run_checked(&["hash-object", "-w", "-t", "blob", "--stdin"], Some(data))?;
        let digest = stdout_line(&out, "hash-object")?;
        ChunkId::new(digest).map_err(|_| FilterError::Storage {
            command: "hash-object".to_string(),
            detail: "did not return an object id".to_string(),
        })
    }

    /// Resolve a revision, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] on failures other than an unknown
    /// revision.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", rev], None)?;
        if out.status.success() {
            Ok(Some(stdout_line(&out.stdout, "rev-parse")?))
        } else if out.status.code() == Some(1) {
            Ok(None)
        } else {
            Err(storage_error("rev-parse", &out))
        }
    }

    /// Read a config value, or `None` if the key is unset.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] on a malformed value or plumbing
    /// failure.
    pub fn config_get(&self, key: &str, value_type: Option<&str>) -> Result<Option<String>> {
        let mut args = vec!["config"];
        if let Some(value_type) = value_type {
            args.push(value_type);
        }
        args.extend(["--get", key]);
        let out = self.run(&args, None)?;
        if out.status.success() {
            Ok(Some(stdout_line(&out.stdout, "config")?))
        } else if out.status.code() == Some(1) {
            Ok(None)
        } else {
            Err(storage_error("config", &out))
        }
    }

    /// Set a local config key, for installer glue.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the config write fails.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", "--local", key, value], None)?;
        Ok(())
    }

    /// Unset a local config key; absent keys are fine.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the config write fails.
    pub fn config_unset(&self, key: &str) -> Result<()> {
        let out = self.run(&["config", "--local", "--unset", key], None)?;
        // Exit 5 means the key was not set.
        if out.status.success() || out.status.code() == Some(5) {
            Ok(())
        } else {
            Err(storage_error("config", &out))
        }
    }

    /// List one tree level.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the tree cannot be read.
    pub fn ls_tree(&self, treeish: &str) -> Result<Vec<TreeEntry>> {
        let out = self.run_checked(&["ls-tree", treeish], None)?;
        parse_tree_listing(&out)
    }

    /// List a tree recursively; entry names are full paths.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the tree cannot be read.
    pub fn ls_tree_recursive(&self, treeish: &str) -> Result<Vec<TreeEntry>> {
        let out = self.run_checked(&["ls-tree", "-r", treeish], None)?;
        parse_tree_listing(&out)
    }

    /// Create a tree object from entries.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if `mktree` rejects the listing.
    pub fn mktree(&self, entries: &[TreeEntry]) -> Result<String> {
        let mut listing = String::new();
        for entry in entries {
            listing.push_str(&entry.format());
            listing.push('\n');
        }
        let out = self.run_checked(&["mktree"], Some(listing.as_bytes()))?;
        stdout_line(&out, "mktree")
    }

    /// Create a commit object under the filter's fixed identity.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the commit cannot be written.
    pub fn commit_tree(
        &self,
        tree: &str,
        parent: Option<&str>,
        message: &str,
    ) -> Result<String> {
        let mut args = vec!["commit-tree", tree, "-m", message];
        if let Some(parent) = parent {
            args.extend(["-p", parent]);
        }
        let (name, email) = COMMIT_IDENT;
        let mut cmd = self.command(&args, true);
        cmd.env("GIT_AUTHOR_NAME", name)
            .env("GIT_AUTHOR_EMAIL", email)
            .env("GIT_COMMITTER_NAME", name)
            .env("GIT_COMMITTER_EMAIL", email);
        let out = spawn_and_wait(cmd, None)?;
        if !out.status.success() {
            return Err(storage_error("commit-tree", &out));
        }
        stdout_line(&out.stdout, "commit-tree")
    }

    /// Compare-and-swap a ref: succeed only if it currently equals
    /// `expected_old` (the all-zero id to assert nonexistence).
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the subprocess cannot run at
    /// all; a refusal is a normal [`RefUpdate::Refused`] outcome.
    pub fn update_ref_cas(
        &self,
        refname: &str,
        new: &str,
        expected_old: &str,
    ) -> Result<RefUpdate> {
        let out = self.run(&["update-ref", refname, new, expected_old], None)?;
        if out.status.success() {
            Ok(RefUpdate::Updated)
        } else {
            Ok(RefUpdate::Refused(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ))
        }
    }

    /// Spawn the long-lived object reader for this repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned.
    pub fn cat_file_batch(&self) -> Result<CatFileBatch> {
        CatFileBatch::spawn(&self.work_dir)
    }

    fn command(&self, args: &[&str], piped_stdin: bool) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.work_dir)
            .stdin(if piped_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(command = args[0], "git");
        spawn_and_wait(self.command(args, stdin.is_some()), stdin)
    }

    fn run_checked(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let out = self.run(args, stdin)?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(storage_error(args[0], &out))
        }
    }
}

fn spawn_and_wait(mut cmd: Command, stdin: Option<&[u8]>) -> Result<Output> {
    let mut child = cmd.spawn()?;
    if let Some(bytes) = stdin {
        // Taking stdin drops it after the write, closing the pipe.
        let mut pipe = child.stdin.take().ok_or_else(|| {
            FilterError::Io(std::io::Error::other("child stdin unavailable"))
        })?;
        pipe.write_all(bytes)?;
    }
    Ok(child.wait_with_output()?)
}

fn run_in(dir: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let out = spawn_and_wait(cmd, stdin)?;
    if out.status.success() {
        Ok(out.stdout)
    } else {
        Err(storage_error(args[0], &out))
    }
}

fn storage_error(command: &str, out: &Output) -> FilterError {
    FilterError::Storage {
        command: command.to_string(),
        detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    }
}

fn stdout_line(stdout: &[u8], command: &str) -> Result<String> {
    let text = std::str::from_utf8(stdout).map_err(|_| FilterError::Storage {
        command: command.to_string(),
        detail: "produced non-UTF-8 output".to_string(),
    })?;
    Ok(text.trim().to_string())
}

fn parse_tree_listing(stdout: &[u8]) -> Result<Vec<TreeEntry>> {
    let text = std::str::from_utf8(stdout).map_err(|_| FilterError::Storage {
        command: "ls-tree".to_string(),
        detail: "produced non-UTF-8 output".to_string(),
    })?;
    text.lines().map(TreeEntry::parse).collect()
}

/// A `cat-file --batch` child reused across every smudge in a session.
#[derive(Debug)]
pub struct CatFileBatch {
    child: Child,
    input: Option<ChildStdin>,
    output: BufReader<ChildStdout>,
}

impl CatFileBatch {
    fn spawn(work_dir: &Path) -> Result<Self> {
        let mut child = Command::new("git")
            .args(["cat-file", "--batch"])
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let input = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            FilterError::Io(std::io::Error::other("cat-file stdout unavailable"))
        })?;
        Ok(Self {
            child,
            input,
            output: BufReader::new(stdout),
        })
    }

    /// Fetch one object's bytes, or `None` if the spec does not resolve.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Storage`] if the batch stream desyncs and
    /// [`FilterError::Io`] on pipe failures.
    pub fn read_object(&mut self, spec: &str) -> Result<Option<Vec<u8>>> {
        let input = self.input.as_mut().ok_or_else(|| {
            FilterError::Io(std::io::Error::other("cat-file stdin already closed"))
        })?;
        input.write_all(spec.as_bytes())?;
        input.write_all(b"\n")?;
        input.flush()?;

        let mut header = String::new();
        if self.output.read_line(&mut header)? == 0 {
            return Err(FilterError::Storage {
                command: "cat-file".to_string(),
                detail: "batch stream closed unexpectedly".to_string(),
            });
        }
        let header = header.trim_end();
        if header.ends_with(" missing") {
            return Ok(None);
        }

        let size: usize = header
            .split_whitespace()
            .nth(2)
            .and_then(|field| field.parse().ok())
            .ok_or_else(|| FilterError::Storage {
                command: "cat-file".to_string(),
                detail: format!("unparsable batch header {header:?}"),
            })?;

        let mut data = vec![0u8; size];
        self.output.read_exact(&mut data)?;
        let mut terminator = [0u8; 1];
        self.output.read_exact(&mut terminator)?;
        Ok(Some(data))
    }
}

impl Drop for CatFileBatch {
    fn drop(&mut self) {
        // Closing stdin lets the child exit on its own.
        drop(self.input.take());
        let _ = self.child.wait();
    }
}
