// src/commands/fetch.rs

//! The fetch driver: ensure archive contents are present locally and stage
//! their distfiles

use super::SetupContext;
use crate::config::{parse_root_descriptor, RepositoryConfig, RootDescriptor};
use crate::error::{Error, Result};
use crate::fetch::content::{create_content_cas_map, stage_distfile, ContentFetchInfo};
use crate::resolver;
use crate::tasks::TaskScope;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Fetch every reachable archive into the local CAS and stage the
/// distfiles into `fetch_dir` (default: the first configured dist-dir).
pub fn cmd_fetch(
    ctx: &SetupContext,
    config: &RepositoryConfig,
    main: &str,
    use_all: bool,
    fetch_dir: Option<PathBuf>,
) -> Result<()> {
    let fetch_dir = match fetch_dir.or_else(|| ctx.distdirs.first().cloned()) {
        Some(dir) => dir,
        None => {
            let considered: Vec<String> = ctx
                .distdirs
                .iter()
                .map(|d| format!("'{}'", d.display()))
                .collect();
            return Err(Error::Fetch(format!(
                "no directory found to fetch to, considered [{}]",
                considered.join(", ")
            )));
        }
    };
    std::fs::create_dir_all(&fetch_dir)?;
    info!("fetching to {}", fetch_dir.display());

    let repos = &config.repositories;
    let fetch_repos = if use_all || main.is_empty() {
        resolver::default_reachable_repositories(repos)
    } else {
        resolver::reachable_repositories(repos, main)?
    };

    // Only archive-type repositories have distfiles to fetch.
    let mut to_fetch: Vec<ContentFetchInfo> = Vec::new();
    for name in &fetch_repos.to_include {
        let terminal = resolver::workspace_root_of(repos, name)?;
        match parse_root_descriptor(terminal, name)? {
            RootDescriptor::Archive(a) => to_fetch.push(ContentFetchInfo {
                content: a.content,
                fetch_url: a.fetch,
                distfile: a.distfile,
                sha256: a.sha256,
                sha512: a.sha512,
                origin: name.clone(),
            }),
            _ => {
                warn!("skipping non-archive repository {}", name);
            }
        }
    }

    let content_map = create_content_cas_map(Arc::clone(&ctx.cas), ctx.distdirs.clone());
    let failed = Arc::new(AtomicBool::new(false));
    {
        let scope = TaskScope::new(ctx.jobs);
        let ts = scope.handle();
        let f2 = Arc::clone(&failed);
        content_map.consume_after_keys_ready(
            &ts,
            to_fetch.clone(),
            |_paths| {},
            move |msg, fatal| {
                if fatal {
                    error!("while performing fetch:\n{}", msg);
                    f2.store(true, Ordering::Release);
                } else {
                    warn!("while performing fetch:\n{}", msg);
                }
            },
        );
        scope.finish();
    }
    if failed.load(Ordering::Acquire) {
        return Err(Error::Fetch("fetch failed".to_string()));
    }

    for info in &to_fetch {
        stage_distfile(&ctx.cas, info, &fetch_dir)?;
    }
    info!("staged {} distfile(s)", to_fetch.len());
    Ok(())
}
