// src/commands/mod.rs

//! Command handlers for the grove CLI

mod fetch;
mod setup;
mod update;

pub use fetch::cmd_fetch;
pub use setup::{cmd_setup, setup_config};
pub use update::cmd_update;

use crate::config::{self, Location, RcFile, RepositoryConfig};
use crate::error::{Error, Result};
use crate::fetch::{Launcher, RemoteCas};
use crate::storage::cas::CasStore;
use crate::storage::{self, StorageConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Options common to all subcommands, resolved from flags and the rc file
#[derive(Debug, Clone, Default)]
pub struct CommonOptions {
    pub config_file: Option<PathBuf>,
    pub rc_file: Option<PathBuf>,
    pub norc: bool,
    pub local_build_root: Option<PathBuf>,
    pub main: Option<String>,
    pub all: bool,
    pub jobs: Option<usize>,
    pub git_bin: Option<String>,
    /// JSON list of strings prefixing every launched command.
    pub launcher: Option<String>,
    pub distdirs: Vec<PathBuf>,
}

/// Everything a setup or fetch run needs besides the configuration itself
pub struct SetupContext {
    pub storage: Arc<StorageConfig>,
    pub cas: Arc<CasStore>,
    pub launcher: Arc<Launcher>,
    pub distdirs: Vec<PathBuf>,
    pub checkout_locations: HashMap<String, PathBuf>,
    pub jobs: usize,
    pub remote_cas: Option<Arc<dyn RemoteCas>>,
}

fn parse_launcher(spec: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(spec)
        .map_err(|e| Error::Config(format!("malformed launcher {}: {}", spec, e)))?;
    let list = value
        .as_array()
        .ok_or_else(|| Error::Config(format!("launcher is not a JSON list: {}", spec)))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Config(format!("non-string launcher entry in {}", spec)))
        })
        .collect()
}

fn resolve_existing_dir(loc: &Location, ws_root: Option<&Path>) -> Option<PathBuf> {
    let (path, _base) = loc.resolve(ws_root)?;
    if path.is_dir() {
        Some(path)
    } else {
        warn!("ignoring non-existing distdir {}", path.display());
        None
    }
}

/// Resolve options and rc file into a ready context plus the configuration
/// file to read.
pub fn build_context(opts: &CommonOptions) -> Result<(SetupContext, PathBuf)> {
    let ws_root = storage::detect_workspace_root();

    // Run-control file: explicit path, or the default when present.
    let rc = if opts.norc {
        RcFile::default()
    } else if let Some(path) = &opts.rc_file {
        RcFile::load(path)?
    } else {
        match storage::home_dir().map(|h| h.join(config::DEFAULT_RC_NAME)) {
            Some(path) if path.is_file() => RcFile::load(&path)?,
            _ => RcFile::default(),
        }
    };

    // Build root: flag wins over rc over default.
    let build_root = opts
        .local_build_root
        .clone()
        .map(|p| storage::weakly_canonical(&p))
        .or_else(|| {
            rc.local_build_root
                .as_ref()
                .and_then(|loc| loc.resolve(ws_root.as_deref()))
                .map(|(path, _)| path)
        })
        .unwrap_or_else(storage::default_build_root);
    debug!("using build root {}", build_root.display());
    let storage_cfg = Arc::new(StorageConfig::new(&build_root)?);
    let cas = Arc::new(CasStore::new(storage_cfg.cas_root())?);

    // Dist-dirs: rc entries first, explicit flags appended.
    let mut distdirs: Vec<PathBuf> = rc
        .distdirs
        .iter()
        .filter_map(|loc| resolve_existing_dir(loc, ws_root.as_deref()))
        .collect();
    for dir in &opts.distdirs {
        let dir = storage::weakly_canonical(dir);
        if dir.is_dir() {
            distdirs.push(dir);
        } else {
            warn!("ignoring non-existing distdir {}", dir.display());
        }
    }

    // Checkout locations, if configured and present.
    let checkout_locations = rc
        .checkout_locations
        .as_ref()
        .and_then(|loc| loc.resolve(ws_root.as_deref()))
        .map(|(path, _)| path)
        .filter(|path| path.is_file())
        .map(|path| config::load_checkout_locations(&path))
        .transpose()?
        .unwrap_or_default();

    let launcher = Launcher {
        prefix: match &opts.launcher {
            Some(spec) => parse_launcher(spec)?,
            None => Launcher::default().prefix,
        },
        git_bin: opts
            .git_bin
            .clone()
            .unwrap_or_else(|| Launcher::default().git_bin),
    };

    let context = SetupContext {
        storage: storage_cfg,
        cas,
        launcher: Arc::new(launcher),
        distdirs,
        checkout_locations,
        jobs: opts.jobs.unwrap_or_else(crate::tasks::default_jobs),
        remote_cas: None,
    };

    // Configuration file: flag, then rc lookup order, then defaults.
    let config_file = match &opts.config_file {
        Some(path) => storage::weakly_canonical(path),
        None => locate_config_file(&rc, ws_root.as_deref())?,
    };
    Ok((context, config_file))
}

fn locate_config_file(rc: &RcFile, ws_root: Option<&Path>) -> Result<PathBuf> {
    if !rc.config_lookup_order.is_empty() {
        for loc in &rc.config_lookup_order {
            if let Some((path, _)) = loc.resolve(ws_root) {
                if path.is_file() {
                    return Ok(path);
                }
            }
        }
    } else if let Some(ws) = ws_root {
        for name in config::DEFAULT_CONFIG_LOCATIONS {
            let path = ws.join(name);
            if path.is_file() {
                return Ok(storage::weakly_canonical(&path));
            }
        }
    }
    Err(Error::Config(
        "cannot find repository configuration".to_string(),
    ))
}

/// Load the configuration and determine the effective main repository.
pub fn load_config_with_main(
    config_file: &Path,
    main_override: Option<&str>,
) -> Result<(RepositoryConfig, String)> {
    let config = RepositoryConfig::load(config_file)?;
    let main = effective_main(&config, main_override);
    Ok((config, main))
}

/// Flag wins over the config's `main`; otherwise the lexicographically
/// smallest repository name.
pub fn effective_main(config: &RepositoryConfig, main_override: Option<&str>) -> String {
    if let Some(main) = main_override {
        return main.to_string();
    }
    if !config.main.is_empty() {
        return config.main.clone();
    }
    crate::resolver::default_main(&config.repositories).unwrap_or_default()
}
