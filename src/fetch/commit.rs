// src/fetch/commit.rs

//! Git-commit fetch map: foreign checkouts into the shared store
//!
//! A repository of type `git` pins an exact commit. The commit is probed
//! in the shared store first; on a miss it is fetched through a temporary
//! repository from the configured checkout-location mirror (or the remote
//! URL), verified present, and pinned with a keep tag. The value is the
//! tree identifier of the commit.

use crate::asyncmap::AsyncMap;
use crate::fetch::Launcher;
use crate::git::store::fetch_via_tmp_repo;
use crate::git::{CriticalGitOpMap, GitOpKey};
use crate::progress::{SetupStats, TaskTracker};
use crate::storage::StorageConfig;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Identity and sources of one pinned commit
#[derive(Debug, Clone)]
pub struct GitCommitInfo {
    pub url: String,
    pub commit: String,
    pub branch: Option<String>,
    /// Reporting label; not part of the identity.
    pub origin: String,
}

// A commit id names its history; mirrors and branches are hints.
impl PartialEq for GitCommitInfo {
    fn eq(&self, other: &Self) -> bool {
        self.commit == other.commit
    }
}

impl Eq for GitCommitInfo {}

impl Hash for GitCommitInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.commit.hash(state);
    }
}

/// Maps a pinned commit to the tree identifier of its root directory.
pub type GitCommitFetchMap = AsyncMap<GitCommitInfo, String>;

/// Create the commit fetch map. `checkout_locations` overrides fetch
/// sources per URL with local mirror paths.
pub fn create_git_commit_fetch_map(
    critical_git_op_map: CriticalGitOpMap,
    storage: Arc<StorageConfig>,
    launcher: Arc<Launcher>,
    checkout_locations: HashMap<String, PathBuf>,
    tracker: Arc<TaskTracker>,
    stats: Arc<SetupStats>,
) -> GitCommitFetchMap {
    let checkout_locations = Arc::new(checkout_locations);
    AsyncMap::new(move |ts, key: GitCommitInfo, setter, logger| {
        let storage = Arc::clone(&storage);
        let launcher = Arc::clone(&launcher);
        let checkout_locations = Arc::clone(&checkout_locations);
        let tracker = Arc::clone(&tracker);
        let stats = Arc::clone(&stats);
        let critical = critical_git_op_map.clone();
        let ts2 = ts.clone();
        let ensure_logger = {
            let logger = logger.clone();
            let target = storage.git_root();
            move |msg: &str, fatal: bool| {
                (*logger)(
                    &format!(
                        "while running critical Git op ENSURE_INIT bare for target {}:\n{}",
                        target.display(),
                        msg
                    ),
                    fatal,
                )
            }
        };
        let ensure_key = GitOpKey::ensure_init(storage.git_root());
        critical_git_op_map.consume_after_keys_ready(
            ts,
            vec![ensure_key],
            move |values| {
                let store = Arc::clone(&values[0].store);
                match store.check_commit_exists(&key.commit) {
                    None => {
                        (*logger)(
                            &format!(
                                "while checking commit {} exists in Git cache: read failed",
                                key.commit
                            ),
                            true,
                        );
                        return;
                    }
                    Some(true) => {
                        stats.record_cache_hit();
                    }
                    Some(false) => {
                        tracker.start(&key.origin);
                        let src = checkout_locations
                            .get(&key.url)
                            .map(|p| p.to_string_lossy().to_string())
                            .unwrap_or_else(|| key.url.clone());
                        debug!("fetching commit {} from {}", key.commit, src);
                        let tmp_dir = match storage.create_typed_tmp_dir("fetch-commit") {
                            Ok(dir) => dir,
                            Err(e) => {
                                (*logger)(
                                    &format!(
                                        "failed to create tmp directory for fetching {}: {}",
                                        key.url, e
                                    ),
                                    true,
                                );
                                return;
                            }
                        };
                        let refspec = key
                            .branch
                            .as_ref()
                            .map(|b| format!("+refs/heads/{}:refs/heads/fetched", b));
                        if let Err(e) = fetch_via_tmp_repo(
                            &storage.git_root(),
                            tmp_dir.path(),
                            &src,
                            refspec.as_deref(),
                            &launcher.git_bin,
                            &launcher.prefix,
                        ) {
                            (*logger)(
                                &format!("while fetching {}:\n{}", src, e),
                                true,
                            );
                            return;
                        }
                        if store.check_commit_exists(&key.commit) != Some(true) {
                            (*logger)(
                                &format!(
                                    "fetching {} did not provide commit {}",
                                    src, key.commit
                                ),
                                true,
                            );
                            return;
                        }
                        tracker.stop(&key.origin);
                        stats.record_fetched();
                    }
                }

                // The commit is present; resolve its tree and pin it.
                let tree_id = match store.commit_tree_id(&key.commit) {
                    Some(id) => id,
                    None => {
                        (*logger)(
                            &format!("cannot resolve tree of commit {}", key.commit),
                            true,
                        );
                        return;
                    }
                };
                let keep_key = GitOpKey::keep_tag(
                    storage.git_root(),
                    key.commit.clone(),
                    "Keep referenced tree alive".to_string(),
                );
                let keep_logger = {
                    let logger = logger.clone();
                    let commit = key.commit.clone();
                    move |msg: &str, fatal: bool| {
                        (*logger)(
                            &format!(
                                "while running critical Git op KEEP_TAG for commit {}:\n{}",
                                commit, msg
                            ),
                            fatal,
                        )
                    }
                };
                critical.consume_after_keys_ready(
                    &ts2,
                    vec![keep_key],
                    move |_values| {
                        setter.set(tree_id);
                    },
                    keep_logger,
                );
            },
            ensure_logger,
        );
    })
}
