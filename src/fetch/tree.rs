// src/fetch/tree.rs

//! Git-tree fetch map: ensure a described tree is in the local Git store
//!
//! Resolution of one tree identifier, in order: probe the shared Git
//! store (a header read suffices), probe the remote CAS if an endpoint is
//! configured, and finally run the descriptor's generator command in a
//! fresh temporary directory. A generated tree is verified against the
//! declared identifier before its objects are fetched into the shared
//! store and pinned; a mismatch is fatal and the diagnostic carries the
//! JSON-serialized command line plus the captured output.

use crate::asyncmap::AsyncMap;
use crate::fetch::import::{CommitInfo, ImportToGitMap};
use crate::fetch::{command_as_json, execute_command, Launcher, RemoteCas};
use crate::git::store::fetch_via_tmp_repo;
use crate::git::{CriticalGitOpMap, GitOpKey};
use crate::progress::{SetupStats, TaskTracker};
use crate::storage::StorageConfig;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity and recipe of one described tree
#[derive(Debug, Clone)]
pub struct GitTreeInfo {
    /// The tree identifier to make present.
    pub tree_id: String,
    /// Generator command producing the tree in its working directory.
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub inherit_env: Vec<String>,
    /// Reporting label; not part of the identity.
    pub origin: String,
}

// A tree identifier names its content; the recipe is auxiliary.
impl PartialEq for GitTreeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.tree_id == other.tree_id
    }
}

impl Eq for GitTreeInfo {}

impl Hash for GitTreeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tree_id.hash(state);
    }
}

/// Value: whether the tree was already in the local store.
pub type GitTreeFetchMap = AsyncMap<GitTreeInfo, bool>;

/// Everything the map's compute function needs besides its key.
struct TreeFetchContext {
    critical_git_op_map: CriticalGitOpMap,
    import_to_git_map: ImportToGitMap,
    storage: Arc<StorageConfig>,
    launcher: Arc<Launcher>,
    remote_cas: Option<Arc<dyn RemoteCas>>,
    tracker: Arc<TaskTracker>,
    stats: Arc<SetupStats>,
}

/// Create the git-tree fetch map.
pub fn create_git_tree_fetch_map(
    critical_git_op_map: CriticalGitOpMap,
    import_to_git_map: ImportToGitMap,
    storage: Arc<StorageConfig>,
    launcher: Arc<Launcher>,
    remote_cas: Option<Arc<dyn RemoteCas>>,
    tracker: Arc<TaskTracker>,
    stats: Arc<SetupStats>,
) -> GitTreeFetchMap {
    let ctx = Arc::new(TreeFetchContext {
        critical_git_op_map,
        import_to_git_map,
        storage,
        launcher,
        remote_cas,
        tracker,
        stats,
    });
    AsyncMap::new(move |ts, key: GitTreeInfo, setter, logger| {
        let ctx = Arc::clone(&ctx);
        let ts2 = ts.clone();
        let ensure_logger = {
            let logger = logger.clone();
            let target = ctx.storage.git_root();
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
        let ensure_key = GitOpKey::ensure_init(ctx.storage.git_root());
        ctx.clone().critical_git_op_map.consume_after_keys_ready(
            ts,
            vec![ensure_key],
            move |values| {
                let store = Arc::clone(&values[0].store);
                // Probe the local store: a header read is sufficient.
                match store.check_tree_exists(&key.tree_id) {
                    None => {
                        (*logger)(
                            &format!(
                                "while checking tree {} exists in Git cache: read failed",
                                key.tree_id
                            ),
                            true,
                        );
                    }
                    Some(true) => {
                        ctx.stats.record_cache_hit();
                        setter.set(true);
                    }
                    Some(false) => {
                        ctx.tracker.start(&key.origin);
                        match try_remote_cas(&ctx, &ts2, &key, setter, logger) {
                            None => {}
                            Some((setter, logger)) => {
                                run_generator(&ctx, &ts2, key, setter, logger)
                            }
                        }
                    }
                }
            },
            ensure_logger,
        );
    })
}

type TreeSetter = crate::asyncmap::ValueSetter<GitTreeInfo, bool>;

/// Probe and retrieve from the remote CAS. Consumes the key when the
/// remote path applies (including its error cases); otherwise hands the
/// setter and logger back for the generator path.
fn try_remote_cas(
    ctx: &Arc<TreeFetchContext>,
    ts: &crate::tasks::TaskSystem,
    key: &GitTreeInfo,
    setter: TreeSetter,
    logger: crate::asyncmap::Logger,
) -> Option<(TreeSetter, crate::asyncmap::Logger)> {
    let Some(remote) = &ctx.remote_cas else {
        return Some((setter, logger));
    };
    if !remote.is_available(&key.tree_id) {
        // Absence is a miss, not a failure.
        return Some((setter, logger));
    }
    let tmp_dir = match ctx.storage.create_typed_tmp_dir("fetch-remote-git-tree") {
        Ok(dir) => dir,
        Err(e) => {
            (*logger)(
                &format!(
                    "failed to create tmp directory for copying git-tree {} from remote CAS: {}",
                    key.tree_id, e
                ),
                true,
            );
            return None;
        }
    };
    if let Err(e) = remote.retrieve_tree(&key.tree_id, tmp_dir.path()) {
        (*logger)(
            &format!(
                "failed to copy git-tree {} to {}: {}",
                key.tree_id,
                tmp_dir.path().display(),
                e
            ),
            true,
        );
        return None;
    }
    ctx.tracker.stop(&key.origin);

    let commit_info = CommitInfo {
        target_path: tmp_dir.path().to_path_buf(),
        source_kind: "tree".to_string(),
        source_id: key.tree_id.clone(),
    };
    let import_logger = {
        let logger = logger.clone();
        let tree_id = key.tree_id.clone();
        let tmp_path = tmp_dir.path().to_path_buf();
        move |msg: &str, fatal: bool| {
            (*logger)(
                &format!(
                    "while moving git-tree {} from {} to local git:\n{}",
                    tree_id,
                    tmp_path.display(),
                    msg
                ),
                fatal,
            )
        }
    };
    let stats = Arc::clone(&ctx.stats);
    ctx.import_to_git_map.consume_after_keys_ready(
        ts,
        vec![commit_info],
        move |_values| {
            // The tmp dir stays alive until the import finished.
            drop(tmp_dir);
            stats.record_fetched();
            setter.set(false);
        },
        import_logger,
    );
    None
}

/// Execute the generator command, verify the produced tree, and pin it.
fn run_generator(
    ctx: &Arc<TreeFetchContext>,
    ts: &crate::tasks::TaskSystem,
    key: GitTreeInfo,
    setter: crate::asyncmap::ValueSetter<GitTreeInfo, bool>,
    logger: crate::asyncmap::Logger,
) {
    let exec_dir = match ctx.storage.create_typed_tmp_dir("git-tree") {
        Ok(dir) => dir,
        Err(e) => {
            (*logger)(
                &format!("failed to create tmp directory for tree id map: {}", e),
                true,
            );
            return;
        }
    };
    let out_dir = match ctx.storage.create_typed_tmp_dir("git-tree") {
        Ok(dir) => dir,
        Err(e) => {
            (*logger)(
                &format!("failed to create tmp directory for tree id map: {}", e),
                true,
            );
            return;
        }
    };

    let cmd_json = command_as_json(&ctx.launcher, &key.command);
    let output = match execute_command(
        &ctx.launcher,
        &key.command,
        &key.env_vars,
        &key.inherit_env,
        exec_dir.path(),
        out_dir.path(),
    ) {
        Ok(output) => output,
        Err(e) => {
            (*logger)(
                &format!("failed to execute command:\n{}\n{}", cmd_json, e),
                true,
            );
            return;
        }
    };

    let commit_key = GitOpKey::initial_commit(
        exec_dir.path().to_path_buf(),
        format!("Content of tree {}", key.tree_id),
    );
    let commit_logger = {
        let logger = logger.clone();
        let target = exec_dir.path().to_path_buf();
        move |msg: &str, fatal: bool| {
            (*logger)(
                &format!(
                    "while running critical Git op INITIAL_COMMIT for target {}:\n{}",
                    target.display(),
                    msg
                ),
                fatal,
            )
        }
    };

    let ctx2 = Arc::clone(ctx);
    let ts2 = ts.clone();
    ctx.critical_git_op_map.consume_after_keys_ready(
        ts,
        vec![commit_key],
        move |values| {
            let op = &values[0];
            let commit_id = match &op.result {
                Some(id) => id.clone(),
                None => {
                    (*logger)("commit failed", true);
                    return;
                }
            };
            // Verify the command created the declared tree.
            match op.store.check_tree_exists(&key.tree_id) {
                None => {
                    (*logger)(
                        &format!("while checking tree {} exists: read failed", key.tree_id),
                        true,
                    );
                    return;
                }
                Some(false) => {
                    (*logger)(
                        &format!(
                            "executing {} did not create specified tree {}{}",
                            cmd_json,
                            key.tree_id,
                            output.diagnostic_suffix()
                        ),
                        true,
                    );
                    return;
                }
                Some(true) => {}
            }

            // Fetch the generated objects into the shared store.
            let fetch_tmp = match ctx2.storage.create_typed_tmp_dir("git-tree") {
                Ok(dir) => dir,
                Err(e) => {
                    (*logger)(
                        &format!(
                            "could not create unique path for target {}: {}",
                            exec_dir.path().display(),
                            e
                        ),
                        true,
                    );
                    return;
                }
            };
            if let Err(e) = fetch_via_tmp_repo(
                &ctx2.storage.git_root(),
                fetch_tmp.path(),
                &exec_dir.path().to_string_lossy(),
                None,
                &ctx2.launcher.git_bin,
                &ctx2.launcher.prefix,
            ) {
                (*logger)(
                    &format!(
                        "while fetch via tmp repo for target {}:\n{}",
                        exec_dir.path().display(),
                        e
                    ),
                    true,
                );
                return;
            }
            drop(fetch_tmp);

            let keep_key = GitOpKey::keep_tag(
                ctx2.storage.git_root(),
                commit_id.clone(),
                "Keep referenced tree alive".to_string(),
            );
            let keep_logger = {
                let logger = logger.clone();
                move |msg: &str, fatal: bool| {
                    (*logger)(
                        &format!(
                            "while running critical Git op KEEP_TAG for commit {}:\n{}",
                            commit_id, msg
                        ),
                        fatal,
                    )
                }
            };
            let ctx3 = Arc::clone(&ctx2);
            let origin = key.origin.clone();
            ctx2.critical_git_op_map.consume_after_keys_ready(
                &ts2,
                vec![keep_key],
                move |_values| {
                    // exec_dir and the captured output stay alive up to
                    // here for diagnostics.
                    drop(exec_dir);
                    drop(out_dir);
                    ctx3.stats.record_executed();
                    ctx3.tracker.stop(&origin);
                    setter.set(false);
                },
                keep_logger,
            );
        },
        commit_logger,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::import::create_import_to_git_map;
    use crate::git::ops::create_critical_git_op_map;
    use crate::git::{store, GitCas};
    use crate::tasks::TaskScope;
    use std::sync::Mutex;

    struct Fixture {
        map: GitTreeFetchMap,
        storage: Arc<StorageConfig>,
        tracker: Arc<TaskTracker>,
        stats: Arc<SetupStats>,
    }

    fn fixture(root: &std::path::Path) -> Fixture {
        let storage = Arc::new(StorageConfig::new(root).unwrap());
        let launcher = Arc::new(Launcher {
            prefix: vec![],
            git_bin: "git".to_string(),
        });
        let tracker = Arc::new(TaskTracker::new());
        let stats = Arc::new(SetupStats::new());
        let critical = create_critical_git_op_map();
        let import_map =
            create_import_to_git_map(critical.clone(), Arc::clone(&storage), Arc::clone(&launcher));
        let map = create_git_tree_fetch_map(
            critical,
            import_map,
            Arc::clone(&storage),
            launcher,
            None,
            Arc::clone(&tracker),
            Arc::clone(&stats),
        );
        Fixture {
            map,
            storage,
            tracker,
            stats,
        }
    }

    fn key_for(tree_id: &str, script: &str) -> GitTreeInfo {
        GitTreeInfo {
            tree_id: tree_id.to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env_vars: BTreeMap::new(),
            inherit_env: vec![],
            origin: "test-tree".to_string(),
        }
    }

    /// Tree id of a directory holding `out/a` with content `hi\n`.
    fn expected_tree(scratch: &std::path::Path) -> String {
        std::fs::create_dir_all(scratch.join("out")).unwrap();
        std::fs::write(scratch.join("out/a"), "hi\n").unwrap();
        let commit = store::initial_commit(scratch, "reference").unwrap();
        GitCas::open(scratch).unwrap().commit_tree_id(&commit).unwrap()
    }

    #[test]
    fn test_generated_tree_is_pinned_then_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let expected = expected_tree(&tmp.path().join("reference"));
        let fx = fixture(&tmp.path().join("build"));

        let key = key_for(&expected, "mkdir out && echo hi > out/a");
        let scope = TaskScope::new(4);
        let ts = scope.handle();
        let hits: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let h2 = Arc::clone(&hits);
        fx.map.consume_after_keys_ready(
            &ts,
            vec![key.clone()],
            move |values| {
                h2.lock().unwrap().push(values[0]);
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();

        assert_eq!(*hits.lock().unwrap(), vec![false]);
        assert_eq!(fx.stats.executed(), 1);
        // Every started origin was stopped on the success path.
        assert_eq!(fx.tracker.started_count(), fx.tracker.stopped_count());
        let shared = GitCas::open(&fx.storage.git_root()).unwrap();
        assert_eq!(shared.check_tree_exists(&expected), Some(true));

        // A fresh map over the same store sees a cache hit.
        let fx2 = fixture(&tmp.path().join("build"));
        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let cached: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let c2 = Arc::clone(&cached);
        fx2.map.consume_after_keys_ready(
            &ts,
            vec![key],
            move |values| {
                *c2.lock().unwrap() = Some(values[0]);
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();
        assert_eq!(*cached.lock().unwrap(), Some(true));
        assert_eq!(fx2.stats.cache_hits(), 1);
    }

    #[test]
    fn test_mismatch_diagnostic_carries_command_and_output() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = fixture(&tmp.path().join("build"));

        let declared = "0123456789012345678901234567890123456789";
        let key = key_for(declared, "mkdir out && echo told-you > out/a");
        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let messages: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let m2 = Arc::clone(&messages);
        fx.map.consume_after_keys_ready(
            &ts,
            vec![key],
            |_values| panic!("must not become ready"),
            move |msg, fatal| {
                m2.lock().unwrap().push((msg.to_string(), fatal));
            },
        );
        scope.finish();

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let (msg, fatal) = &messages[0];
        assert!(*fatal);
        // The JSON-serialized command line and the declared id.
        assert!(msg.contains(r#"["/bin/sh","-c","#), "diagnostic: {}", msg);
        assert!(msg.contains(declared), "diagnostic: {}", msg);
        // No Stop on the failure path.
        assert_eq!(fx.tracker.started_count(), 1);
        assert_eq!(fx.tracker.stopped_count(), 0);
    }

    #[test]
    fn test_command_output_appended_on_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = fixture(&tmp.path().join("build"));

        let declared = "0123456789012345678901234567890123456789";
        let key = key_for(declared, "echo some-diagnostic-output && mkdir out");
        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let seen: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let s2 = Arc::clone(&seen);
        fx.map.consume_after_keys_ready(
            &ts,
            vec![key],
            |_values| panic!("must not become ready"),
            move |msg, _fatal| {
                s2.lock().unwrap().push_str(msg);
            },
        );
        scope.finish();

        let seen = seen.lock().unwrap();
        assert!(
            seen.contains("some-diagnostic-output"),
            "diagnostic: {}",
            seen
        );
    }
}
