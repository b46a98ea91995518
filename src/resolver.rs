// src/resolver.rs

//! Repository dependency resolution
//!
//! Computes which repositories a setup run must include and materialize:
//! `to_include` is the reflexive-transitive closure of the binding graph
//! rooted at the main repository; `to_setup` additionally contains every
//! overlay root (target/rule/expression) referenced by an included
//! repository. Cycles in `bindings` are harmless (the traversal
//! deduplicates); cycles in `repository` name indirection are a
//! configuration error.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::config::ALT_DIRS;

/// Ordered repository lists for a setup run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupRepos {
    /// Repositories participating in the emitted configuration.
    pub to_include: Vec<String>,
    /// Superset of `to_include`: also the overlay roots to materialize.
    pub to_setup: Vec<String>,
}

/// The default main repository: the lexicographically smallest name.
pub fn default_main(repos: &Map<String, Value>) -> Option<String> {
    repos.keys().min().cloned()
}

/// Compute the repository closure reachable from `main`.
pub fn reachable_repositories(repos: &Map<String, Value>, main: &str) -> Result<SetupRepos> {
    if repos.is_empty() {
        return Ok(SetupRepos::default());
    }
    if !repos.contains_key(main) {
        return Err(Error::Resolution(format!(
            "missing config entry for repository {}",
            main
        )));
    }

    // Insertion-order traversal with deduplication; a later-visited name is
    // skipped, not re-added, so cyclic bindings terminate.
    let mut to_include: Vec<String> = Vec::with_capacity(repos.len());
    let mut included: HashSet<String> = HashSet::with_capacity(repos.len());
    let mut worklist: Vec<String> = vec![main.to_string()];
    while let Some(name) = worklist.pop() {
        if included.contains(&name) {
            continue;
        }
        let desc = repos.get(&name).ok_or_else(|| {
            Error::Resolution(format!("missing config entry for repository {}", name))
        })?;
        if let Some(bindings) = desc.get("bindings") {
            let bindings = bindings.as_object().ok_or_else(|| {
                Error::Resolution(format!(
                    "field \"bindings\" of repository {} is not an object",
                    name
                ))
            })?;
            // Reverse so the stack pops bindings in declaration order.
            for bound in bindings.values().rev() {
                let bound = bound.as_str().ok_or_else(|| {
                    Error::Resolution(format!("non-string binding in repository {}", name))
                })?;
                if !included.contains(bound) {
                    worklist.push(bound.to_string());
                }
            }
        }
        included.insert(name.clone());
        to_include.push(name);
    }

    // Overlay roots extend the setup list (deduplicated).
    let mut to_setup = to_include.clone();
    let mut setup_seen: HashSet<String> = included.clone();
    for name in &to_include {
        let desc = &repos[name];
        for layer in ALT_DIRS {
            if let Some(layer_val) = desc.get(*layer) {
                let layer_name = layer_val.as_str().ok_or_else(|| {
                    Error::Resolution(format!(
                        "field \"{}\" of repository {} is not a string",
                        layer, name
                    ))
                })?;
                if !repos.contains_key(layer_name) {
                    return Err(Error::Resolution(format!(
                        "missing config entry for repository {}",
                        layer_name
                    )));
                }
                if setup_seen.insert(layer_name.to_string()) {
                    to_setup.push(layer_name.to_string());
                }
            }
        }
    }

    Ok(SetupRepos {
        to_include,
        to_setup,
    })
}

/// Closure used for a global fetch: every repository, in declaration order.
pub fn default_reachable_repositories(repos: &Map<String, Value>) -> SetupRepos {
    let all: Vec<String> = repos.keys().cloned().collect();
    SetupRepos {
        to_include: all.clone(),
        to_setup: all,
    }
}

/// Follow `repository` name indirection to the terminal description.
///
/// `field` is the value of some repository's `repository` field: a string
/// names another entry whose workspace root is shared; anything else is the
/// terminal description. Cycles are a configuration error.
pub fn resolve_repo<'a>(field: &'a Value, repos: &'a Map<String, Value>) -> Result<&'a Value> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = field;
    while let Some(name) = current.as_str() {
        if !seen.insert(name) {
            return Err(Error::Config(format!(
                "found cyclic dependency for repository {}",
                name
            )));
        }
        let desc = repos
            .get(name)
            .ok_or_else(|| Error::Config(format!("missing config entry for repository {}", name)))?;
        current = desc.get("repository").ok_or_else(|| {
            Error::Config(format!(
                "mandatory key \"repository\" missing for repository {}",
                name
            ))
        })?;
    }
    Ok(current)
}

/// The terminal workspace-root description of repository `name`.
pub fn workspace_root_of<'a>(
    repos: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a Value> {
    let desc = repos
        .get(name)
        .ok_or_else(|| Error::Resolution(format!("missing config entry for repository {}", name)))?;
    let field = desc.get("repository").ok_or_else(|| {
        Error::Config(format!(
            "mandatory key \"repository\" missing for repository {}",
            name
        ))
    })?;
    resolve_repo(field, repos)
}
