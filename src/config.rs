// src/config.rs

//! Repository configuration model
//!
//! The multi-repository configuration is a JSON object with an optional
//! `main` and a `repositories` mapping. Descriptors are kept as untyped
//! JSON maps so unknown fields survive the rewrite verbatim; typed views
//! (`RootDescriptor`) are extracted on demand.
//!
//! This module also reads the run-control file (`~/.groverc`) and resolves
//! its `{root, path, base}` location objects.

use crate::error::{Error, Result};
use crate::hash;
use crate::storage;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Overlay-root fields whose values name other repositories.
pub const ALT_DIRS: &[&str] = &["target_root", "rule_root", "expression_root"];

/// Default configuration file names, looked up workspace-relative in order.
pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["repos.json", "etc/repos.json"];

/// Default run-control file, relative to the home directory.
pub const DEFAULT_RC_NAME: &str = ".groverc";

/// A materialized file root as it appears in emitted configurations:
/// `["file", <path>]` or `["git tree", <tree-id>, <repo-path>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRoot {
    File { path: PathBuf },
    GitTree { tree_id: String, repo_path: PathBuf },
}

impl FileRoot {
    pub fn from_json(value: &Value) -> Result<Self> {
        let arr = value
            .as_array()
            .ok_or_else(|| Error::Config(format!("file root is not an array: {}", value)))?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config(format!("file root has no tag: {}", value)))?;
        match tag {
            "file" => {
                let path = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config(format!("malformed file root: {}", value)))?;
                Ok(FileRoot::File {
                    path: PathBuf::from(path),
                })
            }
            "git tree" => {
                let tree_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config(format!("malformed git tree root: {}", value)))?;
                if !hash::is_object_id(tree_id) {
                    return Err(Error::Config(format!(
                        "malformed tree identifier: {}",
                        tree_id
                    )));
                }
                let repo_path = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Config(format!("malformed git tree root: {}", value)))?;
                Ok(FileRoot::GitTree {
                    tree_id: tree_id.to_string(),
                    repo_path: PathBuf::from(repo_path),
                })
            }
            other => Err(Error::Config(format!("unknown file root tag: {}", other))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FileRoot::File { path } => json!(["file", path.to_string_lossy()]),
            FileRoot::GitTree { tree_id, repo_path } => {
                json!(["git tree", tree_id, repo_path.to_string_lossy()])
            }
        }
    }
}

/// Archive repository descriptor (`type ∈ {archive, zip}`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    /// Blob identifier of the archive content (mandatory).
    pub content: String,
    /// URL to fetch from when no local source has the content (mandatory).
    pub fetch: String,
    /// Dist-dir lookup name; defaults to the basename of `fetch`.
    pub distfile: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// Subdirectory of the unpacked archive serving as the root.
    pub subdir: String,
    /// `archive` (tarball) or `zip`.
    pub archive_type: String,
}

impl ArchiveDescriptor {
    /// Dist-dir and fetch-dir file name for this archive.
    pub fn distfile_name(&self) -> String {
        self.distfile.clone().unwrap_or_else(|| {
            self.fetch
                .rsplit('/')
                .next()
                .unwrap_or(self.fetch.as_str())
                .to_string()
        })
    }
}

/// Generated-tree repository descriptor (`type = "git tree"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDescriptor {
    /// The tree identifier the generator must produce.
    pub tree_id: String,
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub inherit_env: Vec<String>,
}

/// Foreign Git checkout descriptor (`type = "git"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutDescriptor {
    pub url: String,
    pub commit: String,
    pub branch: Option<String>,
}

/// Typed view of a repository's workspace-root description
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootDescriptor {
    /// Pre-pinned root, passed through verbatim.
    Pinned(FileRoot),
    /// Local directory to import.
    File { path: PathBuf },
    Archive(ArchiveDescriptor),
    Tree(TreeDescriptor),
    Checkout(CheckoutDescriptor),
}

fn get_str(desc: &Map<String, Value>, field: &str, ctx: &str) -> Result<String> {
    desc.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("mandatory field \"{}\" missing for {}", field, ctx)))
}

fn get_opt_str(desc: &Map<String, Value>, field: &str) -> Option<String> {
    desc.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Parse a (fully indirection-resolved) `repository` value into a typed
/// root descriptor.
pub fn parse_root_descriptor(value: &Value, ctx: &str) -> Result<RootDescriptor> {
    if value.is_array() {
        let root = FileRoot::from_json(value)?;
        return Ok(match root {
            FileRoot::File { path } => RootDescriptor::File { path },
            pinned @ FileRoot::GitTree { .. } => RootDescriptor::Pinned(pinned),
        });
    }
    let desc = value.as_object().ok_or_else(|| {
        Error::Config(format!("repository description for {} is not an object", ctx))
    })?;
    let repo_type = get_str(desc, "type", ctx)?;
    match repo_type.as_str() {
        "file" => Ok(RootDescriptor::File {
            path: PathBuf::from(get_str(desc, "path", ctx)?),
        }),
        "archive" | "zip" => {
            let content = get_str(desc, "content", ctx)?;
            if !hash::is_object_id(&content) {
                return Err(Error::Config(format!(
                    "unsupported value for mandatory field \"content\" for {}",
                    ctx
                )));
            }
            let subdir = get_opt_str(desc, "subdir").unwrap_or_default();
            Ok(RootDescriptor::Archive(ArchiveDescriptor {
                content,
                fetch: get_str(desc, "fetch", ctx)?,
                distfile: get_opt_str(desc, "distfile"),
                sha256: get_opt_str(desc, "sha256"),
                sha512: get_opt_str(desc, "sha512"),
                subdir: if subdir.is_empty() || subdir == "." {
                    String::new()
                } else {
                    subdir
                },
                archive_type: repo_type,
            }))
        }
        "git tree" => {
            let tree_id = get_str(desc, "id", ctx)?;
            if !hash::is_object_id(&tree_id) {
                return Err(Error::Config(format!(
                    "unsupported value for mandatory field \"id\" for {}",
                    ctx
                )));
            }
            let command = desc
                .get("cmd")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    Error::Config(format!("mandatory field \"cmd\" missing for {}", ctx))
                })?
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Config(format!("non-string entry in \"cmd\" for {}", ctx))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if command.is_empty() {
                return Err(Error::Config(format!("empty \"cmd\" for {}", ctx)));
            }
            let mut env_vars = BTreeMap::new();
            if let Some(env) = desc.get("env") {
                let env = env.as_object().ok_or_else(|| {
                    Error::Config(format!("field \"env\" for {} is not an object", ctx))
                })?;
                for (k, v) in env {
                    let v = v.as_str().ok_or_else(|| {
                        Error::Config(format!("non-string value in \"env\" for {}", ctx))
                    })?;
                    env_vars.insert(k.clone(), v.to_string());
                }
            }
            let mut inherit_env = Vec::new();
            if let Some(inherit) = desc.get("inherit env") {
                let inherit = inherit.as_array().ok_or_else(|| {
                    Error::Config(format!("field \"inherit env\" for {} is not a list", ctx))
                })?;
                for v in inherit {
                    let v = v.as_str().ok_or_else(|| {
                        Error::Config(format!("non-string entry in \"inherit env\" for {}", ctx))
                    })?;
                    inherit_env.push(v.to_string());
                }
            }
            Ok(RootDescriptor::Tree(TreeDescriptor {
                tree_id,
                command,
                env_vars,
                inherit_env,
            }))
        }
        "git" => {
            let commit = get_str(desc, "commit", ctx)?;
            if !hash::is_object_id(&commit) {
                return Err(Error::Config(format!(
                    "unsupported value for mandatory field \"commit\" for {}",
                    ctx
                )));
            }
            Ok(RootDescriptor::Checkout(CheckoutDescriptor {
                url: get_str(desc, "repository", ctx)?,
                commit,
                branch: get_opt_str(desc, "branch"),
            }))
        }
        other => Err(Error::Config(format!(
            "unknown repository type {} for {}",
            other, ctx
        ))),
    }
}

/// The parsed multi-repository configuration
#[derive(Debug, Clone, Default)]
pub struct RepositoryConfig {
    pub main: String,
    pub repositories: Map<String, Value>,
    /// Unknown top-level fields, preserved verbatim in field order.
    pub extra: Map<String, Value>,
}

impl RepositoryConfig {
    pub fn from_json(value: Value) -> Result<Self> {
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(Error::Config(format!(
                    "configuration is not a JSON object: {}",
                    other
                )))
            }
        };
        let mut main = String::new();
        let mut repositories = Map::new();
        let mut extra = Map::new();
        for (key, val) in obj {
            match key.as_str() {
                "main" => {
                    main = val
                        .as_str()
                        .ok_or_else(|| {
                            Error::Config(format!("field \"main\" is not a string: {}", val))
                        })?
                        .to_string();
                }
                "repositories" => {
                    repositories = match val {
                        Value::Object(m) => m,
                        other => {
                            return Err(Error::Config(format!(
                                "field \"repositories\" is not an object: {}",
                                other
                            )))
                        }
                    };
                }
                _ => {
                    extra.insert(key, val);
                }
            }
        }
        for (name, desc) in &repositories {
            if !desc.is_object() {
                return Err(Error::Config(format!(
                    "description of repository {} is not an object",
                    name
                )));
            }
        }
        Ok(Self {
            main,
            repositories,
            extra,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!(
                "parsing config file {} failed: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(value)
    }

    /// Serialize back to JSON. `main` is always present; unknown top-level
    /// fields follow in their original order.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("main".to_string(), Value::String(self.main.clone()));
        obj.insert(
            "repositories".to_string(),
            Value::Object(self.repositories.clone()),
        );
        for (k, v) in &self.extra {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }

    pub fn repository(&self, name: &str) -> Option<&Map<String, Value>> {
        self.repositories.get(name).and_then(Value::as_object)
    }
}

/// Root kind of a run-control location object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationRoot {
    Workspace,
    Home,
    System,
}

fn default_base() -> PathBuf {
    PathBuf::from(".")
}

/// A `{root, path, base?}` location from the run-control file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    pub root: LocationRoot,
    pub path: PathBuf,
    #[serde(default = "default_base")]
    pub base: PathBuf,
}

impl Location {
    pub fn from_json(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("malformed location object {}: {}", value, e)))
    }

    /// Resolve to absolute canonical `(path, base)`. A workspace-rooted
    /// location without a detected workspace is skipped with a warning.
    pub fn resolve(&self, ws_root: Option<&Path>) -> Option<(PathBuf, PathBuf)> {
        let root_path = match self.root {
            LocationRoot::Workspace => match ws_root {
                Some(ws) => ws.to_path_buf(),
                None => {
                    warn!(
                        "not in workspace root, ignoring location {}",
                        self.path.display()
                    );
                    return None;
                }
            },
            LocationRoot::Home => storage::home_dir()?,
            LocationRoot::System => PathBuf::from("/"),
        };
        Some((
            storage::weakly_canonical(&root_path.join(&self.path)),
            storage::weakly_canonical(&root_path.join(&self.base)),
        ))
    }
}

/// Parsed run-control file
#[derive(Debug, Clone, Default)]
pub struct RcFile {
    pub local_build_root: Option<Location>,
    pub checkout_locations: Option<Location>,
    pub distdirs: Vec<Location>,
    pub config_lookup_order: Vec<Location>,
}

impl RcFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read rc file {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            Error::Config(format!("parsing rc file {} failed: {}", path.display(), e))
        })?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Config("rc file does not contain a JSON object".to_string()))?;
        let one = |field: &str| -> Result<Option<Location>> {
            obj.get(field).map(Location::from_json).transpose()
        };
        let many = |field: &str| -> Result<Vec<Location>> {
            match obj.get(field) {
                None => Ok(Vec::new()),
                Some(Value::Array(list)) => list.iter().map(Location::from_json).collect(),
                Some(other) => Err(Error::Config(format!(
                    "rc field \"{}\" is not a list: {}",
                    field, other
                ))),
            }
        };
        Ok(Self {
            local_build_root: one("local build root")?,
            checkout_locations: one("checkout locations")?,
            distdirs: many("distdirs")?,
            config_lookup_order: many("config lookup order")?,
        })
    }
}

/// Read a checkout-locations file: `{"checkouts": {"git": {url: path}}}`.
pub fn load_checkout_locations(path: &Path) -> Result<HashMap<String, PathBuf>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "cannot read checkout locations file {}: {}",
            path.display(),
            e
        ))
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|e| {
        Error::Config(format!(
            "parsing checkout locations file {} failed: {}",
            path.display(),
            e
        ))
    })?;
    let mut out = HashMap::new();
    if let Some(git) = value.get("checkouts").and_then(|c| c.get("git")) {
        let git = git.as_object().ok_or_else(|| {
            Error::Config("checkout locations \"git\" is not an object".to_string())
        })?;
        for (url, path) in git {
            let path = path.as_str().ok_or_else(|| {
                Error::Config(format!("checkout location for {} is not a string", url))
            })?;
            out.insert(url.clone(), PathBuf::from(path));
        }
    }
    Ok(out)
}
