// src/fetch/fpath.rs

//! File-root map: local directories into pinned Git trees
//!
//! A `file` repository root is imported via a copy in a typed temporary
//! directory so the user's source tree is never turned into a Git working
//! repository. Deduplication is by canonical source path.

use crate::asyncmap::AsyncMap;
use crate::fetch::import::{CommitInfo, ImportToGitMap};
use crate::storage::{self, StorageConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Maps a canonical source directory to the tree identifier of its
/// content.
pub type FileRootMap = AsyncMap<PathBuf, String>;

/// Create the file-root map on top of the import map.
pub fn create_file_root_map(
    import_to_git_map: ImportToGitMap,
    storage: Arc<StorageConfig>,
) -> FileRootMap {
    AsyncMap::new(move |ts, source: PathBuf, setter, logger| {
        if !source.is_dir() {
            (*logger)(
                &format!("file root {} is not a directory", source.display()),
                true,
            );
            return;
        }
        let staging = match storage.create_typed_tmp_dir("file-root") {
            Ok(dir) => dir,
            Err(e) => {
                (*logger)(
                    &format!("failed to create staging directory: {}", e),
                    true,
                );
                return;
            }
        };
        if let Err(e) = storage::copy_dir(&source, staging.path()) {
            (*logger)(
                &format!("staging file root {}: {}", source.display(), e),
                true,
            );
            return;
        }

        let commit_info = CommitInfo {
            target_path: staging.path().to_path_buf(),
            source_kind: "file".to_string(),
            source_id: source.to_string_lossy().to_string(),
        };
        let import_logger = {
            let logger = logger.clone();
            let source = source.clone();
            move |msg: &str, fatal: bool| {
                (*logger)(
                    &format!("while importing {} to git:\n{}", source.display(), msg),
                    fatal,
                )
            }
        };
        import_to_git_map.consume_after_keys_ready(
            ts,
            vec![commit_info],
            move |values| {
                // The staging copy stays alive until the import finished.
                drop(staging);
                setter.set(values[0].tree_id.clone());
            },
            import_logger,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::import::create_import_to_git_map;
    use crate::fetch::Launcher;
    use crate::git::ops::create_critical_git_op_map;
    use crate::git::GitCas;
    use crate::tasks::TaskScope;
    use std::sync::Mutex;

    #[test]
    fn test_source_directory_stays_pristine() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageConfig::new(tmp.path().join("build")).unwrap());
        let launcher = Arc::new(Launcher {
            prefix: vec![],
            git_bin: "git".to_string(),
        });

        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "alpha\n").unwrap();
        std::fs::write(src.join("nested/b.txt"), "beta\n").unwrap();

        let critical = create_critical_git_op_map();
        let import_map = create_import_to_git_map(critical, Arc::clone(&storage), launcher);
        let map = create_file_root_map(import_map, Arc::clone(&storage));

        let scope = TaskScope::new(4);
        let ts = scope.handle();
        let got: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        map.consume_after_keys_ready(
            &ts,
            vec![src.clone()],
            move |values| {
                *g2.lock().unwrap() = Some(values[0].clone());
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();

        // No repository was created inside the user's source tree.
        assert!(!src.join(".git").exists());

        let tree = got.lock().unwrap().clone().unwrap();
        let shared = GitCas::open(&storage.git_root()).unwrap();
        assert_eq!(shared.check_tree_exists(&tree), Some(true));
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageConfig::new(tmp.path().join("build")).unwrap());
        let launcher = Arc::new(Launcher {
            prefix: vec![],
            git_bin: "git".to_string(),
        });
        let critical = create_critical_git_op_map();
        let import_map = create_import_to_git_map(critical, Arc::clone(&storage), launcher);
        let map = create_file_root_map(import_map, storage);

        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let fatal_seen = Arc::new(Mutex::new(false));
        let f2 = Arc::clone(&fatal_seen);
        map.consume_after_keys_ready(
            &ts,
            vec![tmp.path().join("missing")],
            |_values| panic!("must not succeed"),
            move |_msg, fatal| {
                if fatal {
                    *f2.lock().unwrap() = true;
                }
            },
        );
        scope.finish();
        assert!(*fatal_seen.lock().unwrap());
    }
}
