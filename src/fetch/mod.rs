// src/fetch/mod.rs

//! The content acquisition pipeline
//!
//! Sub-modules implement the deduplicated async maps that turn repository
//! descriptors into pinned Git trees: archive content into the CAS
//! (`content`), unpacked archives into trees (`archive`), directories into
//! the shared Git store (`import`), local file roots via a staging copy
//! (`fpath`), described trees into the store (`tree`), and foreign Git
//! commits into the store (`commit`).
//!
//! This module holds what they share: the subprocess launcher and the typed
//! seam to an optional remote CAS endpoint.

pub mod archive;
pub mod commit;
pub mod content;
pub mod fpath;
pub mod import;
pub mod tree;

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// How external commands are run: a prefix prepended to every command line
/// plus the Git binary to use for fetches.
#[derive(Debug, Clone)]
pub struct Launcher {
    pub prefix: Vec<String>,
    pub git_bin: String,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            prefix: vec!["env".to_string(), "--".to_string()],
            git_bin: "git".to_string(),
        }
    }
}

/// Captured result of a generator command run
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
}

impl CommandOutput {
    /// Captured stdout/stderr formatted for appending to a diagnostic;
    /// empty when the command produced no output.
    pub fn diagnostic_suffix(&self) -> String {
        let out = std::fs::read_to_string(&self.stdout_file).unwrap_or_default();
        let err = std::fs::read_to_string(&self.stderr_file).unwrap_or_default();
        if out.is_empty() && err.is_empty() {
            String::new()
        } else {
            format!(".\nOutput of command:\n{}{}", out, err)
        }
    }
}

/// Compute a child environment: the ambient environment restricted to
/// `inherit_env`, overlaid with `env_vars` (declared variables win).
pub fn child_environment(
    env_vars: &BTreeMap<String, String>,
    inherit_env: &[String],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for name in inherit_env {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }
    for (k, v) in env_vars {
        env.insert(k.clone(), v.clone());
    }
    // Program lookup needs a search path even under an empty declaration.
    if !env.contains_key("PATH") {
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
    }
    env
}

/// Run `command` (extended by the launcher prefix) in `cwd`, capturing
/// stdout and stderr to files under `out_dir`. A non-zero exit is reported
/// in the returned status, not as an error; failing to start the process
/// is.
pub fn execute_command(
    launcher: &Launcher,
    command: &[String],
    env_vars: &BTreeMap<String, String>,
    inherit_env: &[String],
    cwd: &Path,
    out_dir: &Path,
) -> Result<CommandOutput> {
    let mut cmdline: Vec<String> = launcher.prefix.clone();
    cmdline.extend(command.iter().cloned());
    let (program, args) = cmdline
        .split_first()
        .ok_or_else(|| Error::Internal("empty command line".to_string()))?;

    let stdout_file = out_dir.join("stdout");
    let stderr_file = out_dir.join("stderr");
    let stdout = File::create(&stdout_file)?;
    let stderr = File::create(&stderr_file)?;

    let env = child_environment(env_vars, inherit_env);
    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .map_err(|e| Error::Fetch(format!("failed to execute {}: {}", program, e)))?;
    tracing::debug!(
        "command {:?} in {} exited with {:?}",
        command,
        cwd.display(),
        status.code()
    );

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout_file,
        stderr_file,
    })
}

/// JSON rendering of a command line, as used in diagnostics.
pub fn command_as_json(launcher: &Launcher, command: &[String]) -> String {
    let mut cmdline: Vec<String> = launcher.prefix.clone();
    cmdline.extend(command.iter().cloned());
    serde_json::to_string(&cmdline).unwrap_or_else(|_| format!("{:?}", cmdline))
}

/// Typed seam to a remote content-addressed store. The RPC client behind it
/// is an external collaborator; absence of an endpoint is a cache miss,
/// never a failure.
pub trait RemoteCas: Send + Sync {
    /// Whether the remote store has the given tree.
    fn is_available(&self, tree_id: &str) -> bool;

    /// Materialize the tree's content under `dest`.
    fn retrieve_tree(&self, tree_id: &str, dest: &Path) -> Result<()>;
}
