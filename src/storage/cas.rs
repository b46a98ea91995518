// src/storage/cas.rs

//! Content-addressable storage for archive blobs
//!
//! Blobs are stored under their Git blob identifier, enabling deduplication
//! across repositories that declare the same archive. The store is
//! append-only; concurrent inserts of the same hash are idempotent because
//! the content is identical by definition.

use crate::error::{Error, Result};
use crate::hash;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressable storage manager
pub struct CasStore {
    /// Root directory for object storage (`<build-root>/cas`)
    objects_dir: PathBuf,
}

impl CasStore {
    /// Create a new CAS store with the given objects directory
    pub fn new<P: AsRef<Path>>(objects_dir: P) -> Result<Self> {
        let objects_dir = objects_dir.as_ref().to_path_buf();
        if !objects_dir.exists() {
            fs::create_dir_all(&objects_dir)?;
            debug!("created CAS objects directory: {:?}", objects_dir);
        }
        Ok(Self { objects_dir })
    }

    /// Store content and return its blob identifier.
    ///
    /// Content is stored at `objects/{first2}/{rest_of_hash}`. If the blob
    /// already exists this is a no-op.
    pub fn store(&self, content: &[u8]) -> Result<String> {
        let id = hash::git_blob_id(content);
        let path = self.blob_path(&id);

        if path.exists() {
            debug!("content already in CAS: {}", id);
            return Ok(id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a unique temp file, then rename: readers never observe a
        // partial blob, and racing writers of the same hash both succeed.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.objects_dir)?;
        tmp.write_all(content)?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| Error::IoError(format!("failed to persist CAS blob {}: {}", id, e)))?;

        debug!("stored content in CAS: {} ({} bytes)", id, content.len());
        Ok(id)
    }

    /// Store a file's content; returns its blob identifier.
    pub fn store_file(&self, path: &Path) -> Result<String> {
        let content = fs::read(path)?;
        self.store(&content)
    }

    /// Retrieve blob content by identifier, verifying it on the way out.
    pub fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(id);
        if !path.exists() {
            return Err(Error::IoError(format!("content not found in CAS: {}", id)));
        }
        let content = fs::read(&path)?;
        let computed = hash::git_blob_id(&content);
        if computed != id {
            return Err(Error::ChecksumMismatch {
                expected: id.to_string(),
                actual: computed,
            });
        }
        Ok(content)
    }

    /// Check if a blob with the given identifier exists.
    pub fn exists(&self, id: &str) -> bool {
        self.blob_path(id).exists()
    }

    /// Filesystem path for a given blob identifier.
    ///
    /// Path format: `objects/{first2}/{remaining}`.
    pub fn blob_path(&self, id: &str) -> PathBuf {
        if id.len() < 2 {
            return self.objects_dir.join(id);
        }
        let (prefix, suffix) = id.split_at(2);
        self.objects_dir.join(prefix).join(suffix)
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path()).unwrap();

        let content = b"Test content for CAS";
        let id = cas.store(content).unwrap();
        assert_eq!(id, hash::git_blob_id(content));

        let retrieved = cas.retrieve(&id).unwrap();
        assert_eq!(content, retrieved.as_slice());
    }

    #[test]
    fn test_deduplication() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path()).unwrap();

        let content = b"Duplicate content";
        let id1 = cas.store(content).unwrap();
        let id2 = cas.store(content).unwrap();

        assert_eq!(id1, id2);
        assert!(cas.exists(&id1));
    }

    #[test]
    fn test_blob_path_fan_out() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path()).unwrap();

        let path = cas.blob_path("abc123def456");
        assert_eq!(path, temp_dir.path().join("ab").join("c123def456"));
    }

    #[test]
    fn test_retrieve_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path()).unwrap();
        assert!(cas.retrieve("0000000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_store_file() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path().join("cas")).unwrap();

        let file = temp_dir.path().join("blob.tar");
        std::fs::write(&file, b"archive bytes").unwrap();
        let id = cas.store_file(&file).unwrap();
        assert_eq!(cas.retrieve(&id).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_corrupted_blob_detected() {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasStore::new(temp_dir.path()).unwrap();
        let id = cas.store(b"good content").unwrap();

        std::fs::write(cas.blob_path(&id), b"tampered").unwrap();
        assert!(matches!(
            cas.retrieve(&id),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
