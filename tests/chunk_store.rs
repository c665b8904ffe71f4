//! Chunk store and gateway integration tests against real repositories.

mod common;

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{git_config, git_stdout, init_repo, noise};
use git_fastcdc::{ChunkStore, FilterConfig, FilterError, Git, RefUpdate, CHUNK_REF};

// =============================================================================
// GATEWAY
// =============================================================================

#[test]
fn open_rejects_non_repository() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Git::open(dir.path()).is_err());
}

#[test]
fn hash_object_matches_cli() {
    let (dir, git) = init_repo();
    let id = git.hash_object(b"chunk payload\n").unwrap();

    std::fs::write(dir.path().join("probe"), b"chunk payload\n").unwrap();
    let expected = git_stdout(dir.path(), &["hash-object", "probe"]);
    assert_eq!(id.as_str(), expected);
}

#[test]
fn rev_parse_distinguishes_missing_refs() {
    let (_dir, git) = init_repo();
    assert_eq!(git.rev_parse(CHUNK_REF).unwrap(), None);
}

#[test]
fn config_roundtrip_and_type_coercion() {
    let (dir, git) = init_repo();
    git_config(dir.path(), "fastcdc.ondisk", "yes");
    git_config(dir.path(), "fastcdc.avg", "64k");

    // --type=bool normalizes the truthy spellings.
    assert_eq!(
        git.config_get("fastcdc.ondisk", Some("--type=bool")).unwrap(),
        Some("true".to_string())
    );
    // --type=int expands size suffixes.
    assert_eq!(
        git.config_get("fastcdc.avg", Some("--type=int")).unwrap(),
        Some("65536".to_string())
    );
    assert_eq!(git.config_get("fastcdc.max", None).unwrap(), None);
}

#[test]
fn update_ref_cas_refuses_stale_expectations() {
    let (_dir, git) = init_repo();
    let blob = git.hash_object(b"content").unwrap();
    let tree = git
        .mktree(&[git_fastcdc::TreeEntry::blob(blob.as_str(), "file")])
        .unwrap();
    let commit_a = git.commit_tree(&tree, None, "a").unwrap();
    let commit_b = git.commit_tree(&tree, None, "b").unwrap();

    let zero = "0".repeat(commit_a.len());
    assert!(matches!(
        git.update_ref_cas("refs/heads/cas-probe", &commit_a, &zero).unwrap(),
        RefUpdate::Updated
    ));

    // The ref now holds commit_a; swearing it is still unborn must fail.
    assert!(matches!(
        git.update_ref_cas("refs/heads/cas-probe", &commit_b, &zero).unwrap(),
        RefUpdate::Refused(_)
    ));

    // And the correct expectation succeeds.
    assert!(matches!(
        git.update_ref_cas("refs/heads/cas-probe", &commit_b, &commit_a)
            .unwrap(),
        RefUpdate::Updated
    ));
}

// =============================================================================
// CONFIG LOADING
// =============================================================================

#[test]
fn config_defaults_apply_when_unset() {
    let (_dir, git) = init_repo();
    let config = FilterConfig::load(&git).unwrap();
    assert!(!config.ondisk);
    assert_eq!(config.chunking, git_fastcdc::ChunkerParams::default());
}

#[test]
fn config_overrides_are_honored() {
    let (dir, git) = init_repo();
    git_config(dir.path(), "fastcdc.ondisk", "true");
    git_config(dir.path(), "fastcdc.min", "8k");
    git_config(dir.path(), "fastcdc.avg", "32k");
    git_config(dir.path(), "fastcdc.max", "128k");

    let config = FilterConfig::load(&git).unwrap();
    assert!(config.ondisk);
    assert_eq!(config.chunking.min(), 8192);
    assert_eq!(config.chunking.avg(), 32_768);
    assert_eq!(config.chunking.max(), 131_072);
}

#[test]
fn config_rejects_misordered_sizes() {
    let (dir, git) = init_repo();
    git_config(dir.path(), "fastcdc.min", "128k");
    git_config(dir.path(), "fastcdc.avg", "32k");

    let err = FilterConfig::load(&git).unwrap_err();
    assert!(matches!(err, FilterError::InvalidConfig(_)));
}

// =============================================================================
// CHUNK STORE
// =============================================================================

#[test]
fn finalize_without_chunks_is_a_no_op() {
    let (_dir, git) = init_repo();
    let mut store = ChunkStore::new(git);
    assert!(!store.is_dirty());
    assert_eq!(store.finalize().unwrap(), None);
    assert_eq!(store.git().rev_parse(CHUNK_REF).unwrap(), None);
}

#[test]
fn persist_and_finalize_build_the_fanout_tree() {
    let (dir, git) = init_repo();
    let mut store = ChunkStore::new(git);

    let chunks: Vec<Vec<u8>> = (0..3).map(|i| noise(i, 10_000)).collect();
    let ids: Vec<_> = chunks
        .iter()
        .map(|c| store.persist(c).unwrap())
        .collect();
    assert!(store.is_dirty());

    let tip = store.finalize().unwrap().expect("commit expected");
    assert_eq!(
        git_stdout(dir.path(), &["rev-parse", CHUNK_REF]),
        tip,
        "ref must point at the new commit"
    );

    // Every chunk sits at <pp>/<digest> and its blob id is the digest.
    let listing = git_stdout(dir.path(), &["ls-tree", "-r", CHUNK_REF]);
    for id in &ids {
        let line = format!("100644 blob {}\t{}", id.as_str(), id.branch_path());
        assert!(listing.contains(&line), "missing {line:?} in {listing}");
    }

    // Commit identity and message are fixed.
    let author = git_stdout(dir.path(), &["log", "-1", "--format=%an <%ae>", CHUNK_REF]);
    assert_eq!(author, "git-fastcdc <git-fastcdc@localhost>");
    let subject = git_stdout(dir.path(), &["log", "-1", "--format=%s", CHUNK_REF]);
    assert_eq!(subject, "fastcdc: add 3 chunks");
}

#[test]
fn retrieve_roundtrips_after_commit() {
    let (_dir, git) = init_repo();
    let mut store = ChunkStore::new(git);

    let data = noise(7, 50_000);
    let id = store.persist(&data).unwrap();
    store.finalize().unwrap().expect("commit expected");

    assert_eq!(store.retrieve(&id).unwrap(), data);
}

#[test]
fn retrieve_unknown_digest_is_missing_chunk() {
    let (_dir, git) = init_repo();
    let mut store = ChunkStore::new(git);
    store.persist(b"seed the branch").unwrap();
    store.finalize().unwrap();

    let absent = git_fastcdc::ChunkId::new("ab".repeat(20)).unwrap();
    let err = store.retrieve(&absent).unwrap_err();
    assert!(matches!(err, FilterError::MissingChunk(_)));
}

#[test]
fn duplicate_chunks_produce_one_commit_and_one_entry() {
    let (dir, git) = init_repo();
    let mut store = ChunkStore::new(git);

    let data = noise(3, 20_000);
    let first = store.persist(&data).unwrap();
    let second = store.persist(&data).unwrap();
    assert_eq!(first, second);

    store.finalize().unwrap().expect("commit expected");
    let count = git_stdout(dir.path(), &["rev-list", "--count", CHUNK_REF]);
    assert_eq!(count, "1");

    let listing = git_stdout(dir.path(), &["ls-tree", "-r", "--name-only", CHUNK_REF]);
    assert_eq!(listing.lines().count(), 1);
}

#[test]
fn already_stored_chunks_do_not_commit_again() {
    let (dir, git) = init_repo();
    let data = noise(11, 30_000);

    let mut first = ChunkStore::new(git);
    first.persist(&data).unwrap();
    first.finalize().unwrap().expect("commit expected");

    // A later session re-cleaning the same content finds nothing to add.
    let git = Git::open(dir.path()).unwrap();
    let mut second = ChunkStore::new(git);
    second.persist(&data).unwrap();
    assert!(!second.is_dirty());
    assert_eq!(second.finalize().unwrap(), None);

    let count = git_stdout(dir.path(), &["rev-list", "--count", CHUNK_REF]);
    assert_eq!(count, "1");
}

#[test]
fn sessions_append_linearly_and_preserve_existing_chunks() {
    let (dir, git) = init_repo();

    let data_a = noise(1, 40_000);
    let mut first = ChunkStore::new(git);
    let id_a = first.persist(&data_a).unwrap();
    let tip_a = first.finalize().unwrap().expect("commit expected");

    let data_b = noise(2, 40_000);
    let git = Git::open(dir.path()).unwrap();
    let mut second = ChunkStore::new(git);
    let id_b = second.persist(&data_b).unwrap();
    let tip_b = second.finalize().unwrap().expect("commit expected");

    assert_ne!(tip_a, tip_b);
    assert_eq!(
        git_stdout(dir.path(), &["rev-parse", &format!("{CHUNK_REF}~1")]),
        tip_a,
        "second commit must extend the first"
    );

    let listing = git_stdout(dir.path(), &["ls-tree", "-r", "--name-only", CHUNK_REF]);
    assert!(listing.contains(&id_a.branch_path()));
    assert!(listing.contains(&id_b.branch_path()));
}

#[test]
fn racing_finalizes_collide_on_the_cas_and_linearize() {
    // Two driver instances over one repository, committing at the same
    // moment so both read the tip before either swaps the ref.
    let (dir, git_slow) = init_repo();
    let git_fast = Git::open(dir.path()).unwrap();

    let mut slow = ChunkStore::new(git_slow);
    let mut fast = ChunkStore::new(git_fast);

    // The slow session carries many chunks spread over many fan-out
    // directories, so its window between reading the tip and swapping
    // the ref spans dozens of plumbing calls; the fast session's single
    // chunk lands inside that window and forces the slow swap to lose
    // and retry on top of it.
    let slow_chunks: Vec<Vec<u8>> = (0..24).map(|i| noise(1000 + i, 8192)).collect();
    let slow_ids: Vec<_> = slow_chunks
        .iter()
        .map(|c| slow.persist(c).unwrap())
        .collect();
    let fast_id = fast.persist(&noise(2000, 8192)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let slow_gate = Arc::clone(&barrier);
    let fast_gate = Arc::clone(&barrier);

    let slow_handle = thread::spawn(move || {
        slow_gate.wait();
        slow.finalize().unwrap().expect("slow session must commit")
    });
    let fast_handle = thread::spawn(move || {
        fast_gate.wait();
        fast.finalize().unwrap().expect("fast session must commit")
    });
    let slow_tip = slow_handle.join().unwrap();
    let fast_tip = fast_handle.join().unwrap();

    // Exactly both commits, linearized by the compare-and-swap; a second
    // lost swap would have surfaced as RefContention above instead.
    let count = git_stdout(dir.path(), &["rev-list", "--count", CHUNK_REF]);
    assert_eq!(count, "2", "both sessions must land");

    let head = git_stdout(dir.path(), &["rev-parse", CHUNK_REF]);
    let parent = git_stdout(dir.path(), &["rev-parse", &format!("{CHUNK_REF}~1")]);
    assert!(
        (head == slow_tip && parent == fast_tip) || (head == fast_tip && parent == slow_tip),
        "tips must form one linear history, got head={head} parent={parent}"
    );

    // Neither session lost chunks.
    let listing = git_stdout(dir.path(), &["ls-tree", "-r", "--name-only", CHUNK_REF]);
    for id in &slow_ids {
        assert!(listing.contains(&id.branch_path()), "lost {id}");
    }
    assert!(listing.contains(&fast_id.branch_path()), "lost {fast_id}");
}

#[test]
fn stalled_competitor_exhausts_the_retry_with_ref_contention() {
    let (_dir, git) = init_repo();
    let mut store = ChunkStore::new(git);
    store.persist(&noise(31, 10_000)).unwrap();

    // A concurrent updater stalled mid-swap holds the ref's lock file,
    // so this session loses the swap on the first attempt and on the
    // retry.
    let lock = store
        .git()
        .git_dir()
        .join("refs/heads/git-fastcdc.lock");
    fs::create_dir_all(lock.parent().unwrap()).unwrap();
    fs::write(&lock, b"").unwrap();

    let err = store.finalize().unwrap_err();
    assert!(matches!(err, FilterError::RefContention(_)));

    // The ref itself never moved.
    assert_eq!(store.git().rev_parse(CHUNK_REF).unwrap(), None);

    // Once the competitor is gone the same session can land its batch.
    fs::remove_file(&lock).unwrap();
    assert!(store.finalize().unwrap().is_some());
    assert!(store.git().rev_parse(CHUNK_REF).unwrap().is_some());
}

#[test]
fn shared_prefix_chunks_merge_into_one_directory() {
    // Force two sessions whose chunks happen to share a fan-out prefix by
    // brute-forcing payloads until digests collide on the first byte pair.
    let (dir, git) = init_repo();
    let probe = Git::open(dir.path()).unwrap();

    let mut base = None;
    let mut matching = None;
    for seed in 0..4096u32 {
        let data = noise(seed, 256);
        let id = probe.hash_object(&data).unwrap();
        match &base {
            None => base = Some((data, id)),
            Some((base_data, base_id)) => {
                if id.prefix() == base_id.prefix() && id != *base_id {
                    matching = Some((data, id));
                    break;
                }
            }
        }
    }
    let (data_a, id_a) = base.unwrap();
    let (data_b, id_b) = matching.expect("no prefix collision in 4096 probes");

    let mut first = ChunkStore::new(git);
    first.persist(&data_a).unwrap();
    first.finalize().unwrap();

    let mut second = ChunkStore::new(Git::open(dir.path()).unwrap());
    second.persist(&data_b).unwrap();
    second.finalize().unwrap();

    // Both blobs must live under the same directory of the newest tree.
    let prefix_listing = git_stdout(
        dir.path(),
        &["ls-tree", "--name-only", &format!("{CHUNK_REF}:{}", id_a.prefix())],
    );
    assert!(prefix_listing.contains(id_a.as_str()));
    assert!(prefix_listing.contains(id_b.as_str()));
}
