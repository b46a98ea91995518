// src/hash.rs

//! Hashing and hex utilities for content addressing
//!
//! Three kinds of identifiers flow through the tool:
//! - **Blob identifiers**: Git's object naming scheme (SHA-1 over
//!   `"blob <len>\0" + data`), 40 hex characters. Archives are stored in the
//!   local CAS under their blob identifier.
//! - **Tree identifiers**: 40-hex Git tree hashes, produced by the object
//!   store adapter; this module only validates their shape.
//! - **Archive digests**: SHA-256 / SHA-512 checksums declared next to a
//!   fetch URL and verified after download.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Length of a hex-encoded Git object identifier.
pub const OBJECT_ID_HEX_LEN: usize = 40;
/// Length of a raw (binary) Git object identifier.
pub const OBJECT_ID_RAW_LEN: usize = 20;

/// Digest algorithm selection for archive verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(format!("unknown digest algorithm: {}", s)),
        }
    }
}

/// Incremental hasher over either supported digest algorithm
pub struct Hasher {
    algorithm: DigestAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    /// Finalize and return the digest as a lowercase hex string.
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Sha256(h) => format!("{:x}", h.finalize()),
            HasherState::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }

    #[inline]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }
}

/// Compute a digest of a byte slice.
pub fn hash_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute a digest of data from a reader, streaming in 8 KiB chunks.
pub fn hash_reader<R: Read>(algorithm: DigestAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Compute SHA-256 of a byte slice (convenience)
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(DigestAlgorithm::Sha256, data)
}

/// The Git blob identifier of `data`: SHA-1 over the object header plus
/// payload. This is the identity under which archive contents are stored in
/// the local CAS, so that content names agree with what Git itself would
/// compute for the same file.
pub fn git_blob_id(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", data.len()).as_bytes());
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Git blob identifier of a file's content.
pub fn git_blob_id_of_file(path: &Path) -> io::Result<String> {
    // The header carries the payload length, so the file is read up front.
    let data = std::fs::read(path)?;
    Ok(git_blob_id(&data))
}

/// Check that `s` is a well-formed hex-encoded Git object id.
pub fn is_object_id(s: &str) -> bool {
    s.len() == OBJECT_ID_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Hex-encode raw bytes.
pub fn to_hex(raw: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(raw.len() * 2);
    for b in raw {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Decode a hex string to raw bytes; `None` on odd length or non-hex input.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

/// Verification failure carrying both sides of the comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub expected: String,
    pub actual: String,
    pub algorithm: DigestAlgorithm,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mismatch: expected {}, got {}",
            self.algorithm, self.expected, self.actual
        )
    }
}

impl std::error::Error for VerifyError {}

/// Verify bytes match an expected digest.
pub fn verify_bytes(
    data: &[u8],
    expected: &str,
    algorithm: DigestAlgorithm,
) -> Result<(), VerifyError> {
    let actual = hash_bytes(algorithm, data);
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(VerifyError {
            expected: expected.to_string(),
            actual,
            algorithm,
        })
    }
}

/// Verify a file matches an expected digest, streaming the content.
pub fn verify_file(
    path: &Path,
    expected: &str,
    algorithm: DigestAlgorithm,
) -> Result<(), VerifyError> {
    let actual = std::fs::File::open(path)
        .and_then(|mut f| hash_reader(algorithm, &mut f))
        .map_err(|e| VerifyError {
            expected: expected.to_string(),
            actual: format!("<read error: {}>", e),
            algorithm,
        })?;
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(VerifyError {
            expected: expected.to_string(),
            actual,
            algorithm,
        })
    }
}
