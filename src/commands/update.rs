// src/commands/update.rs

//! The update driver: advance pinned Git commits to current branch tips

use super::SetupContext;
use crate::config::{parse_root_descriptor, RepositoryConfig, RootDescriptor};
use crate::error::{Error, Result};
use crate::git::ops::create_critical_git_op_map;
use crate::git::GitOpKey;
use crate::tasks::TaskScope;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Query a remote for the tip of `branch` via `git ls-remote`.
fn ls_remote_tip(ctx: &SetupContext, url: &str, branch: Option<&str>) -> Result<String> {
    let mut cmdline: Vec<String> = ctx.launcher.prefix.clone();
    cmdline.push(ctx.launcher.git_bin.clone());
    cmdline.push("ls-remote".to_string());
    cmdline.push(url.to_string());
    cmdline.push(
        branch
            .map(|b| format!("refs/heads/{}", b))
            .unwrap_or_else(|| "HEAD".to_string()),
    );

    let (program, args) = cmdline
        .split_first()
        .ok_or_else(|| Error::Internal("empty ls-remote command line".to_string()))?;
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Fetch(format!("failed to execute {}: {}", program, e)))?;
    if !output.status.success() {
        return Err(Error::Fetch(format!(
            "ls-remote for {} failed:\n{}",
            url,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .next()
        .filter(|id| crate::hash::is_object_id(id))
        .map(str::to_string)
        .ok_or_else(|| Error::Fetch(format!("ls-remote for {} returned no commit", url)))
}

/// Advance the `commit` field of the requested git-type repositories (all
/// of them when `repos_to_update` is empty) and return the updated
/// configuration.
pub fn cmd_update(
    ctx: &SetupContext,
    config: &RepositoryConfig,
    repos_to_update: &[String],
) -> Result<Value> {
    let repos = &config.repositories;

    let names: Vec<String> = if repos_to_update.is_empty() {
        repos.keys().cloned().collect()
    } else {
        repos_to_update.to_vec()
    };
    let explicit = !repos_to_update.is_empty();

    // Partition into local mirrors (queried through the critical-op map)
    // and remote URLs (queried via ls-remote).
    let mut local: Vec<(String, GitOpKey)> = Vec::new();
    let mut remote: Vec<(String, String, Option<String>)> = Vec::new();
    for name in &names {
        let desc_value = repos
            .get(name)
            .ok_or_else(|| Error::Config(format!("missing config entry for repository {}", name)))?
            .get("repository")
            .ok_or_else(|| {
                Error::Config(format!(
                    "mandatory key \"repository\" missing for repository {}",
                    name
                ))
            })?;
        let terminal = crate::resolver::resolve_repo(desc_value, repos)?;
        match parse_root_descriptor(terminal, name)? {
            RootDescriptor::Checkout(c) => {
                match ctx.checkout_locations.get(&c.url) {
                    Some(mirror) => {
                        let key = match &c.branch {
                            Some(branch) => {
                                GitOpKey::branch_ref(mirror.clone(), branch.clone())
                            }
                            None => GitOpKey::get_head_id(mirror.clone()),
                        };
                        local.push((name.clone(), key));
                    }
                    None => remote.push((name.clone(), c.url, c.branch)),
                }
            }
            _ if explicit => {
                return Err(Error::Config(format!(
                    "repository {} is not of \"git\" type",
                    name
                )));
            }
            _ => {
                debug!("skipping non-git repository {}", name);
            }
        }
    }

    let new_commits: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let failed = Arc::new(AtomicBool::new(false));

    if !local.is_empty() {
        let map = create_critical_git_op_map();
        let scope = TaskScope::new(ctx.jobs);
        let ts = scope.handle();
        for (name, key) in local {
            let commits = Arc::clone(&new_commits);
            let f2 = Arc::clone(&failed);
            let name2 = name.clone();
            map.consume_after_keys_ready(
                &ts,
                vec![key],
                move |values| {
                    if let Some(commit) = &values[0].result {
                        commits.lock().unwrap().insert(name2, commit.clone());
                    }
                },
                move |msg, fatal| {
                    error!("while updating repository {}:\n{}", name, msg);
                    if fatal {
                        f2.store(true, Ordering::Release);
                    }
                },
            );
        }
        scope.finish();
    }
    for (name, url, branch) in remote {
        match ls_remote_tip(ctx, &url, branch.as_deref()) {
            Ok(commit) => {
                new_commits.lock().unwrap().insert(name, commit);
            }
            Err(e) => {
                error!("while updating repository {}:\n{}", name, e);
                failed.store(true, Ordering::Release);
            }
        }
    }
    if failed.load(Ordering::Acquire) {
        return Err(Error::Fetch("update failed".to_string()));
    }

    // Rewrite the pinned commits in a copy of the configuration.
    let new_commits = new_commits.lock().unwrap();
    let mut repositories = Map::new();
    for (name, desc) in repos {
        let mut desc = desc.clone();
        if let Some(commit) = new_commits.get(name) {
            if let Some(repo) = desc.get_mut("repository").and_then(Value::as_object_mut) {
                info!(
                    "advancing {} from {} to {}",
                    name,
                    repo.get("commit").and_then(|v| v.as_str()).unwrap_or("?"),
                    commit
                );
                repo.insert("commit".to_string(), Value::String(commit.clone()));
            }
        }
        repositories.insert(name.clone(), desc);
    }

    let mut out = Map::new();
    out.insert("main".to_string(), Value::String(config.main.clone()));
    out.insert("repositories".to_string(), Value::Object(repositories));
    for (k, v) in &config.extra {
        out.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context(
        root: &std::path::Path,
        checkouts: HashMap<String, std::path::PathBuf>,
    ) -> SetupContext {
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
            checkout_locations: checkouts,
            jobs: 2,
            remote_cas: None,
        }
    }

    #[test]
    fn test_update_from_local_mirror_head() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = tmp.path().join("mirror");
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::write(mirror.join("f"), "v2").unwrap();
        let head = crate::git::store::initial_commit(&mirror, "tip").unwrap();

        let mut checkouts = HashMap::new();
        checkouts.insert("https://example.com/r.git".to_string(), mirror);
        let ctx = test_context(&tmp.path().join("build"), checkouts);

        let stale = "0123456789012345678901234567890123456789";
        let config = RepositoryConfig::from_json(json!({
            "main": "r",
            "repositories": {
                "r": {"repository": {
                    "type": "git",
                    "repository": "https://example.com/r.git",
                    "commit": stale
                }}
            }
        }))
        .unwrap();

        let updated = cmd_update(&ctx, &config, &[]).unwrap();
        assert_eq!(updated["repositories"]["r"]["repository"]["commit"], head);
        assert_eq!(updated["main"], "r");
    }

    #[test]
    fn test_update_skips_non_git_unless_explicit() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(&tmp.path().join("build"), HashMap::new());
        let config = RepositoryConfig::from_json(json!({
            "repositories": {
                "a": {"repository": ["file", "/src/a"]}
            }
        }))
        .unwrap();

        // Implicit: skipped, output unchanged.
        let updated = cmd_update(&ctx, &config, &[]).unwrap();
        assert_eq!(updated["repositories"]["a"]["repository"], json!(["file", "/src/a"]));

        // Explicit: a config error.
        assert!(matches!(
            cmd_update(&ctx, &config, &["a".to_string()]),
            Err(Error::Config(_))
        ));
    }
}
