//! Content-addressable append-only store for forwarded bytes.
//!
//! See `spec.md` §4.1. The trait is the public contract; [`FsRepository`] is
//! the concrete backing used by the session orchestrator. The upstream
//! implementation this was distilled from (`original_source/pkg/session/
//! internal/git/git.go`) stubs its digest computation entirely — here the
//! digest is a real sha1 over the tree contents, computed once per `digest()`
//! call and cached until the next write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha1::{Digest as _, Sha1};

use crate::error::{Error, Result};

/// `{ algorithm -> hex digest }`, e.g. `{"sha1": "..."}`.
pub type DigestSet = BTreeMap<String, String>;

/// Content-addressable, append-only store for forwarded bytes.
///
/// Implementations must make `create_file` linearizable across concurrent
/// callers (multiple tunnel directions and HTTP handlers may write at once)
/// and must serialize the underlying commit operation with writes.
pub trait RepositoryStore: Send + Sync {
    /// Initializes the store. Fails with [`Error::Invalid`] if the target
    /// directory is missing or non-empty.
    fn init(&self) -> Result<()>;

    /// Writes `bytes` at `relpath`, creating intermediate directories.
    /// Callers guarantee unique relpaths; implementations never overwrite.
    fn create_file(&self, relpath: &str, bytes: &[u8]) -> Result<()>;

    /// Produces a commit over everything written since `init()` or the last
    /// commit and returns its digest set. Idempotent when clean.
    fn digest(&self) -> Result<DigestSet>;

    /// Releases resources held by the store.
    fn close(&self) -> Result<()>;
}

struct State {
    dirty_since_last_commit: Vec<(String, Vec<u8>)>,
    last_digest: Option<DigestSet>,
}

/// Filesystem-backed [`RepositoryStore`]. One sha1 commit digest is kept over
/// the full set of files seen so far (not just the most recent batch), so
/// that `digest()` always describes "the recorded tree as of the call", as
/// required by `spec.md` §4.1.
pub struct FsRepository {
    root: PathBuf,
    state: Mutex<State>,
    committed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(State {
                dirty_since_last_commit: Vec::new(),
                last_digest: None,
            }),
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RepositoryStore for FsRepository {
    fn init(&self) -> Result<()> {
        if self.root.exists() {
            let non_empty = std::fs::read_dir(&self.root)
                .map_err(Error::from)?
                .next()
                .is_some();
            if non_empty {
                return Err(Error::invalid(format!(
                    "repository directory {} is not empty",
                    self.root.display()
                )));
            }
        } else {
            std::fs::create_dir_all(&self.root).map_err(Error::from)?;
        }
        Ok(())
    }

    fn create_file(&self, relpath: &str, bytes: &[u8]) -> Result<()> {
        let full = self.root.join(relpath);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(Error::from)?;
        }
        std::fs::write(&full, bytes).map_err(Error::from)?;

        let mut state = self.state.lock().expect("repository state poisoned");
        state
            .dirty_since_last_commit
            .push((relpath.to_string(), bytes.to_vec()));
        state.last_digest = None;
        Ok(())
    }

    fn digest(&self) -> Result<DigestSet> {
        let mut state = self.state.lock().expect("repository state poisoned");
        if let Some(digest) = &state.last_digest {
            return Ok(digest.clone());
        }

        let mut committed = self.committed.lock().expect("committed set poisoned");
        committed.append(&mut state.dirty_since_last_commit);

        let mut sorted = committed.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha1::new();
        for (path, content) in &sorted {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
        }
        let hex_digest = hex::encode(hasher.finalize());

        let mut digest = DigestSet::new();
        digest.insert("sha1".to_string(), hex_digest);
        state.last_digest = Some(digest.clone());
        Ok(digest)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_fails_on_non_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();
        let repo = FsRepository::new(dir.path());
        let err = repo.init().unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn init_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/repo");
        let repo = FsRepository::new(&target);
        repo.init().unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn digest_is_stable_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        repo.init().unwrap();
        repo.create_file("shell/0000000000000001_ts", b"hello").unwrap();
        let d1 = repo.digest().unwrap();
        let d2 = repo.digest().unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn digest_changes_after_new_write() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        repo.init().unwrap();
        repo.create_file("shell/0000000000000001_ts", b"hello").unwrap();
        let d1 = repo.digest().unwrap();
        repo.create_file("shell/0000000000000002_ts", b"world").unwrap();
        let d2 = repo.digest().unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn create_file_writes_bytes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRepository::new(dir.path());
        repo.init().unwrap();
        repo.create_file("iopub/deadbeef", b"payload").unwrap();
        let content = std::fs::read(dir.path().join("iopub/deadbeef")).unwrap();
        assert_eq!(content, b"payload");
    }
}
