// src/commands/setup.rs

//! The setup driver: materialize every reachable root and emit the pinned
//! configuration

use super::SetupContext;
use crate::config::{parse_root_descriptor, FileRoot, RepositoryConfig, RootDescriptor, ALT_DIRS};
use crate::error::{Error, Result};
use crate::fetch::archive::{create_archive_tree_map, ArchiveRepoInfo};
use crate::fetch::commit::{create_git_commit_fetch_map, GitCommitInfo};
use crate::fetch::content::{create_content_cas_map, ContentFetchInfo};
use crate::fetch::fpath::create_file_root_map;
use crate::fetch::import::create_import_to_git_map;
use crate::fetch::tree::{create_git_tree_fetch_map, GitTreeInfo};
use crate::git::ops::create_critical_git_op_map;
use crate::progress::{SetupStats, TaskTracker};
use crate::resolver;
use crate::storage;
use crate::tasks::TaskScope;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Materialized roots per repository name.
type RootResults = Arc<Mutex<HashMap<String, FileRoot>>>;

/// Compute the pinned configuration for `config`. Returns the emitted JSON
/// object.
pub fn setup_config(
    ctx: &SetupContext,
    config: &RepositoryConfig,
    main: &str,
    use_all: bool,
) -> Result<Value> {
    let repos = &config.repositories;
    let setup_repos = if use_all || main.is_empty() {
        resolver::default_reachable_repositories(repos)
    } else {
        resolver::reachable_repositories(repos, main)?
    };

    // Typed descriptors first: configuration errors surface before any
    // network or subprocess work starts.
    let mut descriptors: Vec<(String, RootDescriptor)> =
        Vec::with_capacity(setup_repos.to_setup.len());
    for name in &setup_repos.to_setup {
        let terminal = resolver::workspace_root_of(repos, name)?;
        let descriptor = parse_root_descriptor(terminal, name)?;
        descriptors.push((name.clone(), descriptor));
    }

    let git_root = ctx.storage.git_root();
    let tracker = Arc::new(TaskTracker::new());
    let stats = Arc::new(SetupStats::new());
    let critical = create_critical_git_op_map();
    let import_map = create_import_to_git_map(
        critical.clone(),
        Arc::clone(&ctx.storage),
        Arc::clone(&ctx.launcher),
    );
    let file_root_map = create_file_root_map(import_map.clone(), Arc::clone(&ctx.storage));
    let content_map = create_content_cas_map(Arc::clone(&ctx.cas), ctx.distdirs.clone());
    let archive_map = create_archive_tree_map(
        content_map,
        import_map.clone(),
        Arc::clone(&ctx.storage),
    );
    let tree_map = create_git_tree_fetch_map(
        critical.clone(),
        import_map.clone(),
        Arc::clone(&ctx.storage),
        Arc::clone(&ctx.launcher),
        ctx.remote_cas.clone(),
        Arc::clone(&tracker),
        Arc::clone(&stats),
    );
    let commit_map = create_git_commit_fetch_map(
        critical,
        Arc::clone(&ctx.storage),
        Arc::clone(&ctx.launcher),
        ctx.checkout_locations.clone(),
        Arc::clone(&tracker),
        Arc::clone(&stats),
    );

    let results: RootResults = Arc::new(Mutex::new(HashMap::new()));
    let failed = Arc::new(AtomicBool::new(false));

    {
        let scope = TaskScope::new(ctx.jobs);
        let ts = scope.handle();
        for (name, descriptor) in descriptors {
            let record = {
                let results = Arc::clone(&results);
                let name = name.clone();
                move |root: FileRoot| {
                    results.lock().unwrap().insert(name, root);
                }
            };
            let on_error = {
                let failed = Arc::clone(&failed);
                let name = name.clone();
                move |msg: &str, fatal: bool| {
                    if fatal {
                        error!("while setting up repository {}:\n{}", name, msg);
                        failed.store(true, Ordering::Release);
                    } else {
                        warn!("while setting up repository {}:\n{}", name, msg);
                    }
                }
            };
            match descriptor {
                RootDescriptor::Pinned(root) => {
                    record(root);
                }
                RootDescriptor::File { path } => {
                    let path = storage::weakly_canonical(&path);
                    let git_root = git_root.clone();
                    file_root_map.consume_after_keys_ready(
                        &ts,
                        vec![path],
                        move |values| {
                            record(FileRoot::GitTree {
                                tree_id: values[0].clone(),
                                repo_path: git_root,
                            });
                        },
                        on_error,
                    );
                }
                RootDescriptor::Archive(a) => {
                    let git_root = git_root.clone();
                    archive_map.consume_after_keys_ready(
                        &ts,
                        vec![ArchiveRepoInfo {
                            archive: ContentFetchInfo {
                                content: a.content,
                                fetch_url: a.fetch,
                                distfile: a.distfile,
                                sha256: a.sha256,
                                sha512: a.sha512,
                                origin: name.clone(),
                            },
                            archive_type: a.archive_type,
                            subdir: a.subdir,
                        }],
                        move |values| {
                            record(FileRoot::GitTree {
                                tree_id: values[0].clone(),
                                repo_path: git_root,
                            });
                        },
                        on_error,
                    );
                }
                RootDescriptor::Tree(t) => {
                    let git_root = git_root.clone();
                    let tree_id = t.tree_id.clone();
                    tree_map.consume_after_keys_ready(
                        &ts,
                        vec![GitTreeInfo {
                            tree_id: t.tree_id,
                            command: t.command,
                            env_vars: t.env_vars,
                            inherit_env: t.inherit_env,
                            origin: name.clone(),
                        }],
                        move |_cache_hit| {
                            record(FileRoot::GitTree {
                                tree_id,
                                repo_path: git_root,
                            });
                        },
                        on_error,
                    );
                }
                RootDescriptor::Checkout(c) => {
                    let git_root = git_root.clone();
                    commit_map.consume_after_keys_ready(
                        &ts,
                        vec![GitCommitInfo {
                            url: c.url,
                            commit: c.commit,
                            branch: c.branch,
                            origin: name.clone(),
                        }],
                        move |values| {
                            record(FileRoot::GitTree {
                                tree_id: values[0].clone(),
                                repo_path: git_root,
                            });
                        },
                        on_error,
                    );
                }
            }
        }
        scope.finish();
    }
    stats.report();

    if failed.load(Ordering::Acquire) {
        return Err(Error::Fetch("setup failed".to_string()));
    }
    let results = results
        .lock()
        .map_err(|_| Error::Internal("root results lock poisoned".to_string()))?
        .clone();
    for name in &setup_repos.to_setup {
        if !results.contains_key(name) {
            return Err(Error::Fetch(format!(
                "no root was materialized for repository {}",
                name
            )));
        }
    }

    emit_config(config, main, &setup_repos.to_include, &results)
}

fn emit_config(
    config: &RepositoryConfig,
    main: &str,
    to_include: &[String],
    roots: &HashMap<String, FileRoot>,
) -> Result<Value> {
    let mut repositories = Map::new();
    for name in to_include {
        let desc = config
            .repository(name)
            .ok_or_else(|| Error::Resolution(format!("missing config entry for repository {}", name)))?;
        let mut out = Map::new();
        for (field, value) in desc {
            match field.as_str() {
                "repository" => {
                    let root = &roots[name];
                    out.insert(field.clone(), root.to_json());
                }
                layer if ALT_DIRS.contains(&layer) => {
                    let overlay = value.as_str().ok_or_else(|| {
                        Error::Resolution(format!(
                            "field \"{}\" of repository {} is not a string",
                            layer, name
                        ))
                    })?;
                    let root = roots.get(overlay).ok_or_else(|| {
                        Error::Resolution(format!(
                            "overlay root {} of repository {} was not set up",
                            overlay, name
                        ))
                    })?;
                    out.insert(field.clone(), root.to_json());
                }
                _ => {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        repositories.insert(name.clone(), Value::Object(out));
    }

    let mut emitted = Map::new();
    emitted.insert("main".to_string(), Value::String(main.to_string()));
    emitted.insert("repositories".to_string(), Value::Object(repositories));
    for (k, v) in &config.extra {
        emitted.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(emitted))
}

/// Run setup and write the emitted configuration, content-addressed, into
/// the build root. Returns the path, which is also printed by the CLI.
pub fn cmd_setup(
    ctx: &SetupContext,
    config: &RepositoryConfig,
    main: &str,
    use_all: bool,
) -> Result<PathBuf> {
    let emitted = setup_config(ctx, config, main, use_all)?;
    let text = serde_json::to_string(&emitted)
        .map_err(|e| Error::Internal(format!("serializing emitted configuration: {}", e)))?;
    let id = crate::hash::git_blob_id(text.as_bytes());
    let path = ctx.storage.generated_root().join(format!("{}.json", id));
    if !path.exists() {
        std::fs::write(&path, &text)?;
    }
    info!("wrote configuration {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context(root: &std::path::Path) -> SetupContext {
        let storage = Arc::new(crate::storage::StorageConfig::new(root).unwrap());
        let cas = Arc::new(crate::storage::cas::CasStore::new(storage.cas_root()).unwrap());
        SetupContext {
            storage,
            cas,
            launcher: Arc::new(crate::fetch::Launcher {
                prefix: vec![],
                git_bin: "git".to_string(),
            }),
            distdirs: vec![],
            checkout_locations: HashMap::new(),
            jobs: 4,
            remote_cas: None,
        }
    }

    #[test]
    fn test_empty_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(&tmp.path().join("build"));
        let config = RepositoryConfig::default();
        let emitted = setup_config(&ctx, &config, "", false).unwrap();
        assert_eq!(emitted, json!({"main": "", "repositories": {}}));
    }

    #[test]
    fn test_file_root_is_pinned() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(&tmp.path().join("build"));

        let src = tmp.path().join("src-a");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("TARGETS"), "{}").unwrap();

        let config = RepositoryConfig::from_json(json!({
            "repositories": {
                "a": {"repository": ["file", src.to_str().unwrap()]}
            }
        }))
        .unwrap();
        let emitted = setup_config(&ctx, &config, "a", false).unwrap();

        let root = &emitted["repositories"]["a"]["repository"];
        assert_eq!(root[0], "git tree");
        let tree_id = root[1].as_str().unwrap();
        assert_eq!(
            root[2].as_str().unwrap(),
            ctx.storage.git_root().to_string_lossy()
        );

        let store = crate::git::GitCas::open(&ctx.storage.git_root()).unwrap();
        assert_eq!(store.check_tree_exists(tree_id), Some(true));
    }

    #[test]
    fn test_cyclic_indirection_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(&tmp.path().join("build"));
        let config = RepositoryConfig::from_json(json!({
            "main": "a",
            "repositories": {
                "a": {"repository": "b"},
                "b": {"repository": "a"}
            }
        }))
        .unwrap();
        let err = setup_config(&ctx, &config, "a", false).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::exit::CONFIG_ERROR);
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(&tmp.path().join("build"));

        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("f"), "x").unwrap();

        let config = RepositoryConfig::from_json(json!({
            "repositories": {
                "a": {
                    "repository": ["file", src.to_str().unwrap()],
                    "target_file_name": "BUILD",
                    "bindings": {},
                    "future field": [1, 2, 3]
                }
            },
            "top-level extension": true
        }))
        .unwrap();
        let emitted = setup_config(&ctx, &config, "a", false).unwrap();
        assert_eq!(emitted["repositories"]["a"]["target_file_name"], "BUILD");
        assert_eq!(emitted["repositories"]["a"]["future field"], json!([1, 2, 3]));
        assert_eq!(emitted["top-level extension"], true);
    }
}
