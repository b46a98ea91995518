// src/storage/mod.rs

//! Build-root layout and filesystem plumbing
//!
//! All persistent state lives under a single build root:
//!
//! ```text
//! <root>/git/        bare Git repository, the shared object store
//! <root>/cas/        content-addressed blob store
//! <root>/tmp/        typed temporary directories
//! <root>/generated/  emitted configurations, content-addressed
//! ```
//!
//! Temporary directories are "typed": each carries a purpose prefix in its
//! name, and cleanup is scoped to the returned guard's lifetime.

pub mod cas;

use crate::error::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Marker files that identify a workspace root.
const WORKSPACE_MARKERS: &[&str] = &["ROOT", "WORKSPACE", ".git"];

/// Paths derived from the local build root
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Create a storage configuration rooted at `root`, creating the
    /// directory skeleton if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["git", "cas", "tmp", "generated"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The shared bare Git repository holding all pinned trees.
    pub fn git_root(&self) -> PathBuf {
        self.root.join("git")
    }

    /// The local content-addressed blob store.
    pub fn cas_root(&self) -> PathBuf {
        self.root.join("cas")
    }

    /// Directory for emitted configurations.
    pub fn generated_root(&self) -> PathBuf {
        self.root.join("generated")
    }

    /// Create a typed temporary directory under `<root>/tmp`. The directory
    /// is removed when the returned guard is dropped.
    pub fn create_typed_tmp_dir(&self, purpose: &str) -> Result<TempDir> {
        let tmp_root = self.root.join("tmp");
        std::fs::create_dir_all(&tmp_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", purpose))
            .tempdir_in(&tmp_root)?;
        debug!("created tmp dir {} for {}", dir.path().display(), purpose);
        Ok(dir)
    }
}

/// Default build root: `~/.cache/grove`, or a path under the system temp
/// directory when no home directory can be determined.
pub fn default_build_root() -> PathBuf {
    if let Some(home) = home_dir() {
        home.join(".cache").join("grove")
    } else {
        std::env::temp_dir().join("grove")
    }
}

/// The invoking user's home directory.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Canonicalize a path without requiring it to exist: the longest existing
/// prefix is resolved and the remainder appended unchanged.
pub fn weakly_canonical(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut existing = absolute.clone();
    let mut tail = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => return absolute,
        }
    }
    let mut out = existing.canonicalize().unwrap_or(existing);
    for part in tail.iter().rev() {
        out.push(part);
    }
    out
}

/// Find the workspace root by searching upward from `start` for a marker
/// file or directory (`ROOT`, `WORKSPACE`, `.git`).
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut dir = weakly_canonical(start);
    loop {
        for marker in WORKSPACE_MARKERS {
            if dir.join(marker).exists() {
                return Some(dir);
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Workspace root for the current invocation directory.
pub fn detect_workspace_root() -> Option<PathBuf> {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| find_workspace_root(&cwd))
}

/// Recursively copy a directory. Regular files keep their permission bits
/// (`fs::copy` preserves them); symlinks are followed.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            crate::error::Error::IoError(format!("walking {}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| crate::error::Error::IoError(format!("stripping prefix: {}", e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_layout_created() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageConfig::new(tmp.path().join("build")).unwrap();
        assert!(storage.git_root().is_dir());
        assert!(storage.cas_root().is_dir());
        assert!(storage.generated_root().is_dir());
    }

    #[test]
    fn test_typed_tmp_dir_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageConfig::new(tmp.path()).unwrap();
        let path = {
            let dir = storage.create_typed_tmp_dir("unpack").unwrap();
            let p = dir.path().to_path_buf();
            assert!(p.is_dir());
            assert!(p
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("unpack-"));
            p
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_find_workspace_root() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        let nested = ws.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(ws.join("ROOT"), "").unwrap();

        let found = find_workspace_root(&nested).unwrap();
        assert_eq!(found, weakly_canonical(&ws));
    }

    #[test]
    fn test_find_workspace_root_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("x/y");
        std::fs::create_dir_all(&nested).unwrap();
        // No markers anywhere up to the filesystem root of the tempdir; the
        // search may still hit a marker above the tempdir (e.g. a .git in a
        // parent), so only assert on the contained case.
        let ws = tmp.path().join("marked");
        std::fs::create_dir_all(ws.join("sub")).unwrap();
        std::fs::write(ws.join("WORKSPACE"), "").unwrap();
        assert_eq!(
            find_workspace_root(&ws.join("sub")).unwrap(),
            weakly_canonical(&ws)
        );
    }

    #[test]
    fn test_copy_dir_preserves_structure_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("plain.txt"), "data").unwrap();
        std::fs::write(src.join("sub/run.sh"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                src.join("sub/run.sh"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        copy_dir(&src, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("plain.txt")).unwrap(), b"data");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("sub/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_weakly_canonical_nonexistent_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("does/not/exist");
        let resolved = weakly_canonical(&path);
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("does/not/exist"));
    }
}
