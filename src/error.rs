// src/error.rs

//! Error types and exit-code mapping
//!
//! All library operations return `Result<T>` with the crate-wide `Error`
//! enum. Each error category maps to a stable process exit code so scripts
//! can distinguish configuration problems from fetch failures.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes, stable across versions.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    /// Matches clap's native exit code for argument errors.
    pub const CLARGS_ERROR: i32 = 2;
    pub const CONFIG_ERROR: i32 = 3;
    pub const FETCH_ERROR: i32 = 4;
    pub const UNKNOWN_COMMAND: i32 = 5;
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration input: bad JSON, type mismatches, cycles in
    /// `repository` indirection, unknown mandatory-field values.
    #[error("configuration error: {0}")]
    Config(String),

    /// A reachable repository name is missing or an overlay root is not a
    /// string.
    #[error("resolution error: {0}")]
    Resolution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// I/O failure with added context where the source error alone would not
    /// identify the operation.
    #[error("{0}")]
    IoError(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("not a git object store: {0}")]
    NotARepository(PathBuf),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Internal invariant violation, e.g. a duplicate ready transition for
    /// an async-map key.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map this error to its process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => exit::CONFIG_ERROR,
            Error::Resolution(_) => exit::CONFIG_ERROR,
            Error::Fetch(_) | Error::ChecksumMismatch { .. } => exit::FETCH_ERROR,
            _ => exit::GENERIC_FAILURE,
        }
    }
}
