// src/git/ops.rs

//! Critical Git operation map
//!
//! libgit2 is not reentrant over a single on-disk repository, so every
//! store-mutating operation goes through this deduplicating map. Results
//! are cached by full key; on top of that, a per-target-path lock registry
//! guarantees that at most one critical operation is in flight per Git
//! directory at any instant, regardless of how many distinct keys target
//! it.

use crate::asyncmap::AsyncMap;
use crate::error::{Error, Result};
use crate::git::store::{self, GitCas};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Store-mutating operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitOpType {
    EnsureInit,
    InitialCommit,
    KeepTag,
    GetHeadId,
    BranchRef,
}

/// Full identity of a critical operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitOpKey {
    pub target_path: PathBuf,
    pub op_type: GitOpType,
    /// Commit hash parameter (KEEP_TAG).
    pub git_hash: String,
    /// Branch name parameter (BRANCH_REF).
    pub branch: String,
    /// Commit or tag message, where applicable.
    pub message: Option<String>,
    /// Whether ENSURE_INIT creates a bare repository.
    pub init_bare: bool,
}

impl GitOpKey {
    /// Ensure a bare object store exists at `path`.
    pub fn ensure_init(path: PathBuf) -> Self {
        Self {
            target_path: path,
            op_type: GitOpType::EnsureInit,
            git_hash: String::new(),
            branch: String::new(),
            message: None,
            init_bare: true,
        }
    }

    /// Stage everything under `path` into a parentless commit.
    pub fn initial_commit(path: PathBuf, message: String) -> Self {
        Self {
            target_path: path,
            op_type: GitOpType::InitialCommit,
            git_hash: String::new(),
            branch: String::new(),
            message: Some(message),
            init_bare: false,
        }
    }

    /// Pin `commit` against garbage collection in the store at `path`.
    pub fn keep_tag(path: PathBuf, commit: String, message: String) -> Self {
        Self {
            target_path: path,
            op_type: GitOpType::KeepTag,
            git_hash: commit,
            branch: String::new(),
            message: Some(message),
            init_bare: false,
        }
    }

    /// Read the HEAD commit id of the repository at `path`.
    pub fn get_head_id(path: PathBuf) -> Self {
        Self {
            target_path: path,
            op_type: GitOpType::GetHeadId,
            git_hash: String::new(),
            branch: String::new(),
            message: None,
            init_bare: false,
        }
    }

    /// Read the commit id a local branch points to.
    pub fn branch_ref(path: PathBuf, branch: String) -> Self {
        Self {
            target_path: path,
            op_type: GitOpType::BranchRef,
            git_hash: String::new(),
            branch,
            message: None,
            init_bare: false,
        }
    }
}

/// Result of a critical operation: the opened store plus the hash the
/// operation produced, if any.
#[derive(Clone)]
pub struct GitOpValue {
    pub store: Arc<GitCas>,
    pub result: Option<String>,
}

pub type CriticalGitOpMap = AsyncMap<GitOpKey, GitOpValue>;

/// One mutex per target Git directory.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn mutex_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

fn run_git_op(key: &GitOpKey) -> Result<GitOpValue> {
    let message = key.message.as_deref().unwrap_or("");
    match key.op_type {
        GitOpType::EnsureInit => {
            let store = store::ensure_init(&key.target_path, key.init_bare)?;
            Ok(GitOpValue {
                store,
                result: None,
            })
        }
        GitOpType::InitialCommit => {
            let commit = store::initial_commit(&key.target_path, message)?;
            let store = open(&key.target_path)?;
            Ok(GitOpValue {
                store,
                result: Some(commit),
            })
        }
        GitOpType::KeepTag => {
            let store = open(&key.target_path)?;
            store::keep_tag(&store, &key.git_hash, message)?;
            Ok(GitOpValue {
                store,
                result: None,
            })
        }
        GitOpType::GetHeadId => {
            let store = open(&key.target_path)?;
            let head = store.head_id()?;
            Ok(GitOpValue {
                store,
                result: Some(head),
            })
        }
        GitOpType::BranchRef => {
            let store = open(&key.target_path)?;
            let commit = store.branch_ref(&key.branch)?;
            Ok(GitOpValue {
                store,
                result: Some(commit),
            })
        }
    }
}

fn open(path: &Path) -> Result<Arc<GitCas>> {
    GitCas::open(path).ok_or_else(|| Error::NotARepository(path.to_path_buf()))
}

/// Create the critical-op map. The compute function may block its worker on
/// the per-path lock; the map guarantees at most one such blocking call per
/// key.
pub fn create_critical_git_op_map() -> CriticalGitOpMap {
    let locks = Arc::new(PathLocks::default());
    AsyncMap::new(move |_ts, key: GitOpKey, setter, logger| {
        let path_lock = locks.mutex_for(&key.target_path);
        let _guard = path_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match run_git_op(&key) {
            Ok(value) => setter.set(value),
            Err(e) => (*logger)(
                &format!(
                    "critical git operation on {} failed: {}",
                    key.target_path.display(),
                    e
                ),
                true,
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskScope;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ensure_init_then_initial_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("f.txt"), "content\n").unwrap();

        let map = create_critical_git_op_map();
        let scope = TaskScope::new(2);
        let ts = scope.handle();

        let git_root = tmp.path().join("git");
        let result: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let r2 = Arc::clone(&result);
        map.consume_after_keys_ready(
            &ts,
            vec![
                GitOpKey::ensure_init(git_root.clone()),
                GitOpKey::initial_commit(src, "import".to_string()),
            ],
            move |values| {
                assert!(values[0].result.is_none());
                *r2.lock().unwrap() = values[1].result.clone();
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();

        assert!(git_root.join("objects").is_dir());
        let commit = result.lock().unwrap().clone().unwrap();
        assert_eq!(commit.len(), 40);
    }

    #[test]
    fn test_same_key_runs_once() {
        let tmp = tempfile::tempdir().unwrap();
        let git_root = tmp.path().join("git");

        let map = create_critical_git_op_map();
        let scope = TaskScope::new(4);
        let ts = scope.handle();

        let completions = Arc::new(AtomicU32::new(0));
        for _ in 0..6 {
            let c = Arc::clone(&completions);
            map.consume_after_keys_ready(
                &ts,
                vec![GitOpKey::ensure_init(git_root.clone())],
                move |_values| {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                |msg, _fatal| panic!("unexpected error: {}", msg),
            );
        }
        scope.finish();
        assert_eq!(completions.load(Ordering::Relaxed), 6);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_missing_repository_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let map = create_critical_git_op_map();
        let scope = TaskScope::new(2);
        let ts = scope.handle();

        let failed = Arc::new(AtomicU32::new(0));
        let f2 = Arc::clone(&failed);
        map.consume_after_keys_ready(
            &ts,
            vec![GitOpKey::get_head_id(tmp.path().join("nope"))],
            |_values| panic!("must not succeed"),
            move |_msg, fatal| {
                assert!(fatal);
                f2.fetch_add(1, Ordering::Relaxed);
            },
        );
        scope.finish();
        assert_eq!(failed.load(Ordering::Relaxed), 1);
    }
}
