// src/fetch/import.rs

//! Import-to-git map: directories into the shared object store
//!
//! A directory is imported as an orphan commit in place, the reachable
//! objects are then fetched into the shared store through a temporary
//! repository, and a keep tag pins the commit against garbage collection.
//! The value is the resulting tree identifier together with the commit
//! that witnesses it.

use crate::asyncmap::{wrap_logger, AsyncMap};
use crate::git::store::fetch_via_tmp_repo;
use crate::git::{CriticalGitOpMap, GitOpKey};
use crate::fetch::Launcher;
use crate::storage::StorageConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Identity of one directory import
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitInfo {
    /// Directory to import; also the working repository of the commit.
    pub target_path: PathBuf,
    /// What the directory holds, for the commit message (`archive`, `tree`,
    /// `file`).
    pub source_kind: String,
    /// Content identifier of the source, for the commit message.
    pub source_id: String,
}

/// Result of an import
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub tree_id: String,
    pub commit_id: String,
}

pub type ImportToGitMap = AsyncMap<CommitInfo, ImportResult>;

/// Create the import map on top of the critical-op map.
pub fn create_import_to_git_map(
    critical_git_op_map: CriticalGitOpMap,
    storage: Arc<StorageConfig>,
    launcher: Arc<Launcher>,
) -> ImportToGitMap {
    AsyncMap::new(move |ts, key: CommitInfo, setter, logger| {
        let message = format!("Content of {} {}", key.source_kind, key.source_id);
        let commit_key = GitOpKey::initial_commit(key.target_path.clone(), message);
        let ensure_key = GitOpKey::ensure_init(storage.git_root());

        let critical = critical_git_op_map.clone();
        let storage = Arc::clone(&storage);
        let launcher = Arc::clone(&launcher);
        let ts2 = ts.clone();
        let outer_logger = logger.clone();
        let target_path_for_err = key.target_path.clone();
        critical_git_op_map.consume_after_keys_ready(
            ts,
            vec![ensure_key, commit_key],
            move |values| {
                let commit_id = match &values[1].result {
                    Some(id) => id.clone(),
                    None => {
                        (*outer_logger)("import commit returned no id", true);
                        return;
                    }
                };
                let tree_id = match values[1].store.commit_tree_id(&commit_id) {
                    Some(id) => id,
                    None => {
                        (*outer_logger)(
                            &format!("cannot resolve tree of commit {}", commit_id),
                            true,
                        );
                        return;
                    }
                };

                // Bring the new objects into the shared store, then pin
                // them.
                let tmp_dir = match storage.create_typed_tmp_dir("import-to-git") {
                    Ok(dir) => dir,
                    Err(e) => {
                        (*outer_logger)(
                            &format!("failed to create tmp directory for import: {}", e),
                            true,
                        );
                        return;
                    }
                };
                if let Err(e) = fetch_via_tmp_repo(
                    &storage.git_root(),
                    tmp_dir.path(),
                    &key.target_path.to_string_lossy(),
                    None,
                    &launcher.git_bin,
                    &launcher.prefix,
                ) {
                    (*outer_logger)(
                        &format!(
                            "while fetching {} into the shared store: {}",
                            key.target_path.display(),
                            e
                        ),
                        true,
                    );
                    return;
                }
                drop(tmp_dir);

                let keep_key = GitOpKey::keep_tag(
                    storage.git_root(),
                    commit_id.clone(),
                    "Keep referenced tree alive".to_string(),
                );
                let keep_logger = wrap_logger(outer_logger.clone(), move |msg| {
                    format!("while running critical Git op KEEP_TAG:\n{}", msg)
                });
                critical.consume_after_keys_ready(
                    &ts2,
                    vec![keep_key],
                    move |_values| {
                        setter.set(ImportResult {
                            tree_id,
                            commit_id,
                        });
                    },
                    move |msg, fatal| (*keep_logger)(msg, fatal),
                );
            },
            {
                let target = target_path_for_err;
                move |msg, fatal| {
                    (*logger)(
                        &format!(
                            "while running critical Git op INITIAL_COMMIT for target {}:\n{}",
                            target.display(),
                            msg
                        ),
                        fatal,
                    )
                }
            },
        );
    })
}
