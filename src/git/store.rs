// src/git/store.rs

//! Git object database adapter
//!
//! Wraps libgit2 (via the `git2` crate) with the access discipline the rest
//! of the pipeline relies on: `Repository::open` has no thread-safety
//! guarantee, so every open goes through a process-wide mutex, and each
//! handle guards its repository behind an internal mutex so concurrent
//! readers can share one `Arc<GitCas>`. Mutations of the shared store are
//! additionally serialized by the critical-op map, not here.

use crate::error::{Error, Result};
use crate::hash;
use git2::{IndexAddOption, ObjectType, Oid, Repository, Signature};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Serializes calls into `git_repository_open`/`git_repository_init`.
static REPO_OPEN_MUTEX: Mutex<()> = Mutex::new(());

/// Committer identity for imports and keep tags.
const COMMITTER_NAME: &str = "grove";
const COMMITTER_EMAIL: &str = "grove@localhost";

/// Object kinds appearing in tree walks, by Git file mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Executable,
    Tree,
}

impl ObjectKind {
    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectKind::Tree)
    }
}

/// `100644 → File`, `100755 → Executable`, `040000 → Tree`; anything else
/// is unsupported.
fn filemode_to_kind(mode: i32) -> Option<ObjectKind> {
    match mode {
        0o100644 => Some(ObjectKind::File),
        0o100755 => Some(ObjectKind::Executable),
        0o040000 => Some(ObjectKind::Tree),
        _ => None,
    }
}

fn object_type_to_kind(t: ObjectType) -> Option<ObjectKind> {
    match t {
        ObjectType::Blob => Some(ObjectKind::File),
        ObjectType::Tree => Some(ObjectKind::Tree),
        _ => None,
    }
}

/// One level of a tree: raw child id → (name, kind) entries. A child id can
/// appear under several names when identical subtrees are referenced more
/// than once.
pub type TreeEntries = HashMap<Vec<u8>, Vec<(String, ObjectKind)>>;

/// For a given raw id, either all entries are trees or none of them.
fn validate_entries(entries: &TreeEntries) -> bool {
    entries.values().all(|nodes| {
        nodes.iter().all(|(_, kind)| kind.is_tree()) || !nodes.iter().any(|(_, kind)| kind.is_tree())
    })
}

fn parse_oid(id: &[u8], is_hex: bool) -> Option<Oid> {
    if is_hex {
        Oid::from_str(std::str::from_utf8(id).ok()?).ok()
    } else {
        if id.len() != hash::OBJECT_ID_RAW_LEN {
            return None;
        }
        Oid::from_bytes(id).ok()
    }
}

/// Handle to an open Git object database
pub struct GitCas {
    path: PathBuf,
    repo: Mutex<Repository>,
}

impl GitCas {
    /// Open the object database rooted at `path`; `None` if the directory
    /// is not a Git object store.
    pub fn open(path: &Path) -> Option<Arc<GitCas>> {
        let repo = {
            let _guard = REPO_OPEN_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
            Repository::open(path)
        };
        match repo {
            Ok(repo) => Some(Arc::new(GitCas {
                path: path.to_path_buf(),
                repo: Mutex::new(repo),
            })),
            Err(e) => {
                debug!("opening git repository {} failed: {}", path.display(), e);
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> T) -> T {
        let repo = self.repo.lock().unwrap_or_else(PoisonError::into_inner);
        f(&repo)
    }

    /// Read the raw payload of an object; `None` on not-found or malformed
    /// id.
    pub fn read_object(&self, id: &[u8], is_hex: bool) -> Option<Vec<u8>> {
        let oid = parse_oid(id, is_hex)?;
        self.with_repo(|repo| {
            let odb = repo.odb().ok()?;
            let obj = odb.read(oid).ok()?;
            Some(obj.data().to_vec())
        })
    }

    /// Read just the header of an object: cheaper than the body.
    pub fn read_header(&self, id: &[u8], is_hex: bool) -> Option<(usize, ObjectKind)> {
        let oid = parse_oid(id, is_hex)?;
        self.with_repo(|repo| {
            let odb = repo.odb().ok()?;
            let (size, kind) = odb.read_header(oid).ok()?;
            Some((size, object_type_to_kind(kind)?))
        })
    }

    /// Walk one level of a tree. `None` on lookup failure or an unsupported
    /// entry mode.
    pub fn read_tree(&self, id: &[u8], is_hex: bool) -> Option<TreeEntries> {
        let oid = parse_oid(id, is_hex)?;
        self.with_repo(|repo| {
            let tree = repo.find_tree(oid).ok()?;
            let mut entries: TreeEntries = HashMap::with_capacity(tree.len());
            for entry in tree.iter() {
                let name = entry.name()?.to_string();
                let kind = filemode_to_kind(entry.filemode())?;
                entries
                    .entry(entry.id().as_bytes().to_vec())
                    .or_default()
                    .push((name, kind));
            }
            debug_assert!(validate_entries(&entries));
            Some(entries)
        })
    }

    /// Presence check for a tree id; `None` on I/O error, otherwise whether
    /// the object exists as a tree.
    pub fn check_tree_exists(&self, tree_id: &str) -> Option<bool> {
        self.check_object_kind(tree_id, ObjectType::Tree)
    }

    /// Presence check for a commit id.
    pub fn check_commit_exists(&self, commit_id: &str) -> Option<bool> {
        self.check_object_kind(commit_id, ObjectType::Commit)
    }

    fn check_object_kind(&self, id: &str, wanted: ObjectType) -> Option<bool> {
        let oid = match Oid::from_str(id) {
            Ok(oid) => oid,
            Err(_) => return None,
        };
        self.with_repo(|repo| {
            let odb = repo.odb().ok()?;
            match odb.read_header(oid) {
                Ok((_, kind)) => Some(kind == wanted),
                Err(e) if e.code() == git2::ErrorCode::NotFound => Some(false),
                Err(_) => None,
            }
        })
    }

    /// Tree identifier of a commit.
    pub fn commit_tree_id(&self, commit_id: &str) -> Option<String> {
        let oid = Oid::from_str(commit_id).ok()?;
        self.with_repo(|repo| {
            let commit = repo.find_commit(oid).ok()?;
            Some(commit.tree_id().to_string())
        })
    }

    /// Commit id of HEAD.
    pub fn head_id(&self) -> Result<String> {
        self.with_repo(|repo| {
            let head = repo.head()?.peel_to_commit()?;
            Ok(head.id().to_string())
        })
    }

    /// Commit id a local branch points to.
    pub fn branch_ref(&self, branch: &str) -> Result<String> {
        self.with_repo(|repo| {
            let reference = repo.find_branch(branch, git2::BranchType::Local)?;
            let commit = reference.get().peel_to_commit()?;
            Ok(commit.id().to_string())
        })
    }
}

/// Idempotently create a repository at `path` and return a handle.
pub fn ensure_init(path: &Path, bare: bool) -> Result<Arc<GitCas>> {
    {
        let _guard = REPO_OPEN_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        if Repository::open(path).is_err() {
            std::fs::create_dir_all(path)?;
            if bare {
                Repository::init_bare(path)?;
            } else {
                Repository::init(path)?;
            }
        }
    }
    GitCas::open(path).ok_or_else(|| Error::NotARepository(path.to_path_buf()))
}

/// Idempotently create a bare object store at `path`.
pub fn ensure_bare_init(path: &Path) -> Result<Arc<GitCas>> {
    ensure_init(path, true)
}

/// Stage everything under `path`, write a tree and a parentless commit, and
/// return the commit identifier. Initializes a repository at `path` if none
/// exists; ignored and hidden files are included.
pub fn initial_commit(path: &Path, message: &str) -> Result<String> {
    let repo = {
        let _guard = REPO_OPEN_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        Repository::init(path)?
    };
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::FORCE, None)?;
    index.write()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;
    let sig = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
    let commit = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?;
    debug!(
        "initial commit {} (tree {}) in {}",
        commit,
        tree_oid,
        path.display()
    );
    Ok(commit.to_string())
}

/// Write an annotated tag referencing `commit_id` so the commit (and its
/// tree) stays reachable from garbage collection.
pub fn keep_tag(store: &GitCas, commit_id: &str, message: &str) -> Result<()> {
    let oid = Oid::from_str(commit_id)?;
    store.with_repo(|repo| {
        let obj = repo.find_object(oid, None)?;
        let sig = Signature::now(COMMITTER_NAME, COMMITTER_EMAIL)?;
        repo.tag(&format!("keep-{}", commit_id), &obj, &sig, message, true)?;
        Ok(())
    })
}

/// Bring the objects reachable from `src` into the object database at
/// `store_path` without importing any refs: an external `git fetch` runs in
/// a temporary repository whose object directory is redirected to the
/// shared store. `src` may be a local path or a URL.
pub fn fetch_via_tmp_repo(
    store_path: &Path,
    tmp_dir: &Path,
    src: &str,
    refspec: Option<&str>,
    git_bin: &str,
    launcher: &[String],
) -> Result<()> {
    {
        let _guard = REPO_OPEN_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
        Repository::init_bare(tmp_dir)?;
    }

    let mut cmdline: Vec<String> = launcher.to_vec();
    cmdline.push(git_bin.to_string());
    cmdline.push("fetch".to_string());
    cmdline.push(src.to_string());
    // Without an explicit refspec, fetch HEAD into a scratch ref; the
    // temporary repository's refs are discarded either way.
    cmdline.push(
        refspec
            .map(str::to_string)
            .unwrap_or_else(|| "+HEAD:refs/heads/fetched".to_string()),
    );

    let (program, args) = cmdline
        .split_first()
        .ok_or_else(|| Error::Internal("empty fetch command line".to_string()))?;
    let output = Command::new(program)
        .args(args)
        .current_dir(tmp_dir)
        .env("GIT_DIR", tmp_dir)
        .env("GIT_OBJECT_DIRECTORY", store_path.join("objects"))
        .env_remove("GIT_WORK_TREE")
        .env_remove("GIT_INDEX_FILE")
        .output()
        .map_err(|e| Error::Fetch(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::Fetch(format!(
            "fetching {} into {} failed:\n{}",
            src,
            store_path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    debug!("fetched {} into {}", src, store_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_dir(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("src");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), "alpha\n").unwrap();
        std::fs::write(dir.join("sub/b.txt"), "beta\n").unwrap();
        dir
    }

    #[test]
    fn test_ensure_bare_init_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("git");
        let first = ensure_bare_init(&path).unwrap();
        let second = ensure_bare_init(&path).unwrap();
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn test_open_non_repository() {
        let tmp = TempDir::new().unwrap();
        assert!(GitCas::open(tmp.path()).is_none());
    }

    #[test]
    fn test_initial_commit_and_tree_lookup() {
        let tmp = TempDir::new().unwrap();
        let dir = sample_dir(&tmp);
        let commit = initial_commit(&dir, "import").unwrap();

        let store = GitCas::open(&dir).unwrap();
        let tree_id = store.commit_tree_id(&commit).unwrap();
        assert!(store.check_tree_exists(&tree_id).unwrap());
        assert!(store.check_commit_exists(&commit).unwrap());
        assert_eq!(store.check_tree_exists(&commit), Some(false));

        let entries = store.read_tree(tree_id.as_bytes(), true).unwrap();
        let mut names: Vec<String> = entries
            .values()
            .flat_map(|nodes| nodes.iter().map(|(name, _)| name.clone()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(validate_entries(&entries));
    }

    #[test]
    fn test_initial_commit_is_content_addressed() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();
        let dir1 = sample_dir(&tmp1);
        let dir2 = sample_dir(&tmp2);

        let c1 = initial_commit(&dir1, "one").unwrap();
        let c2 = initial_commit(&dir2, "two").unwrap();
        let t1 = GitCas::open(&dir1).unwrap().commit_tree_id(&c1).unwrap();
        let t2 = GitCas::open(&dir2).unwrap().commit_tree_id(&c2).unwrap();
        // Same content, same tree, regardless of commit metadata.
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_read_object_and_header() {
        let tmp = TempDir::new().unwrap();
        let dir = sample_dir(&tmp);
        let commit = initial_commit(&dir, "import").unwrap();
        let store = GitCas::open(&dir).unwrap();
        let tree_id = store.commit_tree_id(&commit).unwrap();

        let entries = store.read_tree(tree_id.as_bytes(), true).unwrap();
        let blob_raw = entries
            .iter()
            .find(|(_, nodes)| nodes.iter().any(|(name, _)| name == "a.txt"))
            .map(|(raw, _)| raw.clone())
            .unwrap();
        let data = store.read_object(&blob_raw, false).unwrap();
        assert_eq!(data, b"alpha\n");

        let (size, kind) = store.read_header(&blob_raw, false).unwrap();
        assert_eq!(size, 6);
        assert_eq!(kind, ObjectKind::File);
    }

    #[test]
    fn test_read_object_malformed_id() {
        let tmp = TempDir::new().unwrap();
        let dir = sample_dir(&tmp);
        initial_commit(&dir, "import").unwrap();
        let store = GitCas::open(&dir).unwrap();
        assert!(store.read_object(b"nothex", true).is_none());
        assert!(store.read_object(b"short", false).is_none());
    }

    #[test]
    fn test_keep_tag_and_head() {
        let tmp = TempDir::new().unwrap();
        let dir = sample_dir(&tmp);
        let commit = initial_commit(&dir, "import").unwrap();
        let store = GitCas::open(&dir).unwrap();

        keep_tag(&store, &commit, "keep referenced tree alive").unwrap();
        // Idempotent by force-overwrite.
        keep_tag(&store, &commit, "keep referenced tree alive").unwrap();

        assert_eq!(store.head_id().unwrap(), commit);
    }

    #[test]
    fn test_filemode_translation() {
        assert_eq!(filemode_to_kind(0o100644), Some(ObjectKind::File));
        assert_eq!(filemode_to_kind(0o100755), Some(ObjectKind::Executable));
        assert_eq!(filemode_to_kind(0o040000), Some(ObjectKind::Tree));
        assert_eq!(filemode_to_kind(0o120000), None);
    }

    #[test]
    fn test_fetch_via_tmp_repo_moves_objects() {
        let tmp = TempDir::new().unwrap();
        let dir = sample_dir(&tmp);
        let commit = initial_commit(&dir, "import").unwrap();
        let src_tree = GitCas::open(&dir).unwrap().commit_tree_id(&commit).unwrap();

        let store_path = tmp.path().join("shared");
        let shared = ensure_bare_init(&store_path).unwrap();
        assert_eq!(shared.check_tree_exists(&src_tree), Some(false));

        let fetch_tmp = tmp.path().join("fetch-tmp");
        std::fs::create_dir_all(&fetch_tmp).unwrap();
        fetch_via_tmp_repo(
            &store_path,
            &fetch_tmp,
            dir.to_str().unwrap(),
            None,
            "git",
            &[],
        )
        .unwrap();

        assert_eq!(shared.check_tree_exists(&src_tree), Some(true));
        assert_eq!(shared.check_commit_exists(&commit), Some(true));
    }
}
