// src/fetch/content.rs

//! Content-CAS map: deduplicated acquisition of archive content
//!
//! Given an archive declaration, ensure a blob with the declared content
//! identifier is present in the local CAS. Resolution order: local CAS,
//! then each configured dist-dir (a mismatching candidate is a diagnostic,
//! not a failure), then the network. Failure is fatal only when no source
//! yielded the declared content.

use crate::asyncmap::AsyncMap;
use crate::error::{Error, Result};
use crate::hash::{self, DigestAlgorithm};
use crate::storage::cas::CasStore;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Timeout for a single HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum retry attempts for failed downloads.
const MAX_RETRIES: u32 = 3;
/// Delay between retries.
const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Identity and sources of one archive blob
#[derive(Debug, Clone)]
pub struct ContentFetchInfo {
    /// Blob identifier of the archive content.
    pub content: String,
    pub fetch_url: String,
    pub distfile: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// Reporting label; not part of the identity.
    pub origin: String,
}

impl ContentFetchInfo {
    /// Dist-dir file name: the declared distfile or the URL basename.
    pub fn distfile_name(&self) -> String {
        self.distfile.clone().unwrap_or_else(|| {
            self.fetch_url
                .rsplit('/')
                .next()
                .unwrap_or(self.fetch_url.as_str())
                .to_string()
        })
    }
}

// The content hash alone is the identity: two repositories declaring the
// same blob coalesce onto one acquisition regardless of mirror or origin.
impl PartialEq for ContentFetchInfo {
    fn eq(&self, other: &Self) -> bool {
        self.content == other.content
    }
}

impl Eq for ContentFetchInfo {}

impl Hash for ContentFetchInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content.hash(state);
    }
}

/// Maps an archive declaration to the CAS path of its blob.
pub type ContentCasMap = AsyncMap<ContentFetchInfo, PathBuf>;

fn check_candidate(cas: &CasStore, key: &ContentFetchInfo, path: &Path) -> Result<PathBuf> {
    let observed = hash::git_blob_id_of_file(path)?;
    if observed != key.content {
        return Err(Error::ChecksumMismatch {
            expected: key.content.clone(),
            actual: observed,
        });
    }
    let id = cas.store_file(path)?;
    Ok(cas.blob_path(&id))
}

fn verify_digests(key: &ContentFetchInfo, data: &[u8]) -> Result<()> {
    if let Some(expected) = &key.sha256 {
        hash::verify_bytes(data, expected, DigestAlgorithm::Sha256)
            .map_err(|e| Error::ChecksumMismatch {
                expected: e.expected,
                actual: e.actual,
            })?;
    }
    if let Some(expected) = &key.sha512 {
        hash::verify_bytes(data, expected, DigestAlgorithm::Sha512)
            .map_err(|e| Error::ChecksumMismatch {
                expected: e.expected,
                actual: e.actual,
            })?;
    }
    Ok(())
}

fn fetch_from_network(key: &ContentFetchInfo) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::Fetch(format!("failed to create HTTP client: {}", e)))?;

    let mut last_error = String::new();
    for attempt in 1..=MAX_RETRIES {
        match client.get(&key.fetch_url).send() {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.bytes() {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) => last_error = format!("reading response failed: {}", e),
                },
                Err(e) => last_error = format!("server error: {}", e),
            },
            Err(e) => last_error = format!("request failed: {}", e),
        }
        if attempt < MAX_RETRIES {
            debug!(
                "fetch attempt {}/{} for {} failed: {}",
                attempt, MAX_RETRIES, key.fetch_url, last_error
            );
            std::thread::sleep(RETRY_DELAY);
        }
    }
    Err(Error::Fetch(format!(
        "fetching {} failed after {} attempts: {}",
        key.fetch_url, MAX_RETRIES, last_error
    )))
}

/// Create the content-CAS map over the local CAS and the configured
/// dist-dirs. The compute function may block its worker on the network;
/// the map guarantees at most one such call per content hash.
pub fn create_content_cas_map(cas: Arc<CasStore>, distdirs: Vec<PathBuf>) -> ContentCasMap {
    AsyncMap::new(move |_ts, key: ContentFetchInfo, setter, logger| {
        // Local CAS first.
        if cas.exists(&key.content) {
            debug!("content {} already in CAS", key.content);
            setter.set(cas.blob_path(&key.content));
            return;
        }

        // Dist-dirs in order; a failed candidate is diagnostic only.
        let distfile = key.distfile_name();
        for dir in &distdirs {
            let candidate = dir.join(&distfile);
            if !candidate.is_file() {
                continue;
            }
            match check_candidate(&cas, &key, &candidate) {
                Ok(path) => {
                    info!(
                        "found content {} in dist-dir {}",
                        key.content,
                        dir.display()
                    );
                    setter.set(path);
                    return;
                }
                Err(e) => {
                    (*logger)(
                        &format!(
                            "ignoring dist-dir candidate {}: {}",
                            candidate.display(),
                            e
                        ),
                        false,
                    );
                }
            }
        }

        // Network, last.
        let data = match fetch_from_network(&key) {
            Ok(data) => data,
            Err(e) => {
                (*logger)(
                    &format!("while fetching content {}: {}", key.content, e),
                    true,
                );
                return;
            }
        };
        if let Err(e) = verify_digests(&key, &data) {
            (*logger)(
                &format!("verifying download of {}: {}", key.fetch_url, e),
                true,
            );
            return;
        }
        let observed = hash::git_blob_id(&data);
        if observed != key.content {
            (*logger)(
                &format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    key.fetch_url, key.content, observed
                ),
                true,
            );
            return;
        }
        match cas.store(&data) {
            Ok(id) => setter.set(cas.blob_path(&id)),
            Err(e) => (*logger)(&format!("storing fetched content: {}", e), true),
        }
    })
}

/// Copy a blob out of the CAS into `fetch_dir` under its distfile name;
/// used by the fetch subcommand.
pub fn stage_distfile(cas: &CasStore, key: &ContentFetchInfo, fetch_dir: &Path) -> Result<()> {
    let data = cas.retrieve(&key.content)?;
    let dest = fetch_dir.join(key.distfile_name());
    std::fs::write(&dest, data)?;
    info!("staged {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskScope;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn info_for(data: &[u8], origin: &str) -> ContentFetchInfo {
        ContentFetchInfo {
            content: hash::git_blob_id(data),
            fetch_url: "file:///nonexistent/archive.tar".to_string(),
            distfile: Some("archive.tar".to_string()),
            sha256: None,
            sha512: None,
            origin: origin.to_string(),
        }
    }

    #[test]
    fn test_identity_is_content_hash() {
        let a = info_for(b"same", "repo-a");
        let mut b = info_for(b"same", "repo-b");
        b.fetch_url = "https://elsewhere.example/other.tar".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dist_dir_hit_no_network() {
        let tmp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(tmp.path().join("cas")).unwrap());
        let distdir = tmp.path().join("dist");
        std::fs::create_dir_all(&distdir).unwrap();
        std::fs::write(distdir.join("archive.tar"), b"archive payload").unwrap();

        let key = info_for(b"archive payload", "x");
        let map = create_content_cas_map(Arc::clone(&cas), vec![distdir]);

        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let got: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        map.consume_after_keys_ready(
            &ts,
            vec![key.clone()],
            move |values| {
                *g2.lock().unwrap() = Some(values[0].clone());
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();

        assert!(cas.exists(&key.content));
        assert_eq!(got.lock().unwrap().clone().unwrap(), cas.blob_path(&key.content));
    }

    #[test]
    fn test_mismatching_dist_candidate_is_nonfatal_then_fatal_without_source() {
        let tmp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(tmp.path().join("cas")).unwrap());
        let distdir = tmp.path().join("dist");
        std::fs::create_dir_all(&distdir).unwrap();
        std::fs::write(distdir.join("archive.tar"), b"wrong bytes").unwrap();

        let key = info_for(b"right bytes", "x");
        let map = create_content_cas_map(Arc::clone(&cas), vec![distdir]);

        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let warnings = Arc::new(AtomicU32::new(0));
        let fatals = Arc::new(AtomicU32::new(0));
        let w2 = Arc::clone(&warnings);
        let f2 = Arc::clone(&fatals);
        map.consume_after_keys_ready(
            &ts,
            vec![key],
            |_values| panic!("must not succeed"),
            move |_msg, fatal| {
                if fatal {
                    f2.fetch_add(1, Ordering::Relaxed);
                } else {
                    w2.fetch_add(1, Ordering::Relaxed);
                }
            },
        );
        scope.finish();

        assert_eq!(warnings.load(Ordering::Relaxed), 1);
        // file:// is not a supported transport; the network stage fails and
        // no source remains.
        assert_eq!(fatals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cas_hit_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(tmp.path().join("cas")).unwrap());
        cas.store(b"already here").unwrap();

        let key = info_for(b"already here", "x");
        let map = create_content_cas_map(Arc::clone(&cas), vec![]);

        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let hits = Arc::new(AtomicU32::new(0));
        let h2 = Arc::clone(&hits);
        map.consume_after_keys_ready(
            &ts,
            vec![key],
            move |_values| {
                h2.fetch_add(1, Ordering::Relaxed);
            },
            |msg, _fatal| panic!("unexpected error: {}", msg),
        );
        scope.finish();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stage_distfile() {
        let tmp = tempfile::tempdir().unwrap();
        let cas = CasStore::new(tmp.path().join("cas")).unwrap();
        cas.store(b"dist me").unwrap();
        let key = info_for(b"dist me", "x");

        let fetch_dir = tmp.path().join("fetched");
        std::fs::create_dir_all(&fetch_dir).unwrap();
        stage_distfile(&cas, &key, &fetch_dir).unwrap();
        assert_eq!(
            std::fs::read(fetch_dir.join("archive.tar")).unwrap(),
            b"dist me"
        );
    }
}
