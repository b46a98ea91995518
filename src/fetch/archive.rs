// src/fetch/archive.rs

//! Archive-root map: archives into pinned Git trees
//!
//! Chains the content-CAS map and the import-to-git map: the blob is
//! unpacked into a typed temporary directory, imported into the shared
//! store, and the declared `subdir` is resolved to its tree identifier by
//! walking the imported tree one level at a time.

use crate::asyncmap::AsyncMap;
use crate::compression;
use crate::error::{Error, Result};
use crate::fetch::content::{ContentCasMap, ContentFetchInfo};
use crate::fetch::import::{CommitInfo, ImportToGitMap};
use crate::git::GitCas;
use crate::hash;
use crate::storage::StorageConfig;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Identity of one archive root
#[derive(Debug, Clone)]
pub struct ArchiveRepoInfo {
    pub archive: ContentFetchInfo,
    /// `archive` (tarball) or `zip`.
    pub archive_type: String,
    /// Subdirectory of the unpacked archive serving as the root; empty for
    /// the archive root itself.
    pub subdir: String,
}

impl PartialEq for ArchiveRepoInfo {
    fn eq(&self, other: &Self) -> bool {
        self.archive == other.archive
            && self.archive_type == other.archive_type
            && self.subdir == other.subdir
    }
}

impl Eq for ArchiveRepoInfo {}

impl Hash for ArchiveRepoInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.archive.hash(state);
        self.archive_type.hash(state);
        self.subdir.hash(state);
    }
}

/// Maps an archive declaration to the tree identifier of its root.
pub type ArchiveTreeMap = AsyncMap<ArchiveRepoInfo, String>;

/// Unpack `data` into `dest` according to the archive type.
pub fn unpack_archive(data: &[u8], archive_type: &str, dest: &Path) -> Result<()> {
    match archive_type {
        "zip" => unpack_zip(data, dest),
        _ => unpack_tar(data, dest),
    }
}

fn unpack_tar(data: &[u8], dest: &Path) -> Result<()> {
    let decoder = compression::create_decoder_auto(data)
        .map_err(|e| Error::Fetch(format!("cannot decode archive: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    // Archive::unpack rejects entries escaping the destination.
    archive
        .unpack(dest)
        .map_err(|e| Error::Fetch(format!("unpacking archive failed: {}", e)))?;
    Ok(())
}

fn unpack_zip(data: &[u8], dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data))
        .map_err(|e| Error::Fetch(format!("cannot open zip archive: {}", e)))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::Fetch(format!("reading zip entry failed: {}", e)))?;
        let Some(rel) = file.enclosed_name() else {
            warn!("skipping zip entry with unsafe path: {}", file.name());
            continue;
        };
        let out_path = dest.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)?;
        std::fs::write(&out_path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match file.unix_mode() {
                Some(mode) if mode & 0o111 != 0 => 0o755,
                _ => 0o644,
            };
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Resolve `subdir` within `tree_id` by flat tree walks; empty components
/// are skipped.
pub fn resolve_subdir_tree(store: &GitCas, tree_id: &str, subdir: &str) -> Result<String> {
    let mut current = tree_id.to_string();
    for component in subdir.split('/').filter(|c| !c.is_empty() && *c != ".") {
        let entries = store.read_tree(current.as_bytes(), true).ok_or_else(|| {
            Error::Fetch(format!("cannot read tree {} from the local store", current))
        })?;
        let mut next = None;
        for (raw_id, nodes) in &entries {
            for (name, kind) in nodes {
                if name == component && kind.is_tree() {
                    next = Some(hash::to_hex(raw_id));
                }
            }
        }
        current = next.ok_or_else(|| {
            Error::Fetch(format!(
                "subdir component {} not found in tree {}",
                component, current
            ))
        })?;
    }
    Ok(current)
}

/// Create the archive-root map: content acquisition, unpack, import,
/// subdir resolution.
pub fn create_archive_tree_map(
    content_cas_map: ContentCasMap,
    import_to_git_map: ImportToGitMap,
    storage: Arc<StorageConfig>,
) -> ArchiveTreeMap {
    AsyncMap::new(move |ts, key: ArchiveRepoInfo, setter, logger| {
        let storage = Arc::clone(&storage);
        let import_map = import_to_git_map.clone();
        let ts2 = ts.clone();
        let outer_logger = logger.clone();
        let content_logger = {
            let origin = key.archive.origin.clone();
            let logger = logger.clone();
            move |msg: &str, fatal: bool| {
                (*logger)(
                    &format!("while fetching archive for {}:\n{}", origin, msg),
                    fatal,
                )
            }
        };
        let key2 = key.clone();
        content_cas_map.consume_after_keys_ready(
            ts,
            vec![key.archive.clone()],
            move |blob_paths| {
                let data = match std::fs::read(&blob_paths[0]) {
                    Ok(data) => data,
                    Err(e) => {
                        (*outer_logger)(
                            &format!("reading CAS blob {}: {}", blob_paths[0].display(), e),
                            true,
                        );
                        return;
                    }
                };
                let unpack_dir = match storage.create_typed_tmp_dir("unpack") {
                    Ok(dir) => dir,
                    Err(e) => {
                        (*outer_logger)(
                            &format!("failed to create unpack directory: {}", e),
                            true,
                        );
                        return;
                    }
                };
                if let Err(e) = unpack_archive(&data, &key2.archive_type, unpack_dir.path()) {
                    (*outer_logger)(
                        &format!("unpacking content {}: {}", key2.archive.content, e),
                        true,
                    );
                    return;
                }

                let commit_info = CommitInfo {
                    target_path: unpack_dir.path().to_path_buf(),
                    source_kind: key2.archive_type.clone(),
                    source_id: key2.archive.content.clone(),
                };
                let subdir = key2.subdir.clone();
                let git_root = storage.git_root();
                let import_logger = {
                    let logger = outer_logger.clone();
                    let content = key2.archive.content.clone();
                    move |msg: &str, fatal: bool| {
                        (*logger)(
                            &format!("while importing archive {} to git:\n{}", content, msg),
                            fatal,
                        )
                    }
                };
                import_map.consume_after_keys_ready(
                    &ts2,
                    vec![commit_info],
                    move |values| {
                        // The unpack directory stays alive until the import
                        // completed.
                        drop(unpack_dir);
                        let root_tree = &values[0].tree_id;
                        if subdir.is_empty() {
                            setter.set(root_tree.clone());
                            return;
                        }
                        let store = match GitCas::open(&git_root) {
                            Some(store) => store,
                            None => {
                                (*outer_logger)(
                                    &format!("could not open repository {}", git_root.display()),
                                    true,
                                );
                                return;
                            }
                        };
                        match resolve_subdir_tree(&store, root_tree, &subdir) {
                            Ok(tree) => setter.set(tree),
                            Err(e) => (*outer_logger)(&e.to_string(), true),
                        }
                    },
                    import_logger,
                );
            },
            content_logger,
        );
    })
}
