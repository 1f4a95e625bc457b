//! Error taxonomy for the engine.
//!
//! Per-dependency resolution failures are not errors: they are
//! [`crate::resolve::ResolutionOutcome`] variants and survive into the snapshot.

use std::io;
use std::path::PathBuf;

/// A manifest could not be parsed. The scanner downgrades this to a
/// per-repository warning.
#[derive(Debug, thiserror::Error)]
#[error("failed to parse {}:{line}:{column}: {message}", .path.display())]
pub struct ManifestParseError {
    pub path: PathBuf,
    /// 1-based line of the parse failure (0 when the parser gave no position).
    pub line: usize,
    /// 1-based column of the parse failure (0 when the parser gave no position).
    pub column: usize,
    pub message: String,
}

impl ManifestParseError {
    /// Build from a TOML error, mapping its byte span onto line/column.
    pub fn from_toml(path: PathBuf, source: &str, err: &toml::de::Error) -> Self {
        let (line, column) = err
            .span()
            .map(|span| line_col(source, span.start))
            .unwrap_or((0, 0));
        Self {
            path,
            line,
            column,
            message: err.message().to_string(),
        }
    }

    pub fn io(path: PathBuf, err: &io::Error) -> Self {
        Self {
            path,
            line: 0,
            column: 0,
            message: err.to_string(),
        }
    }
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source.as_bytes()[..offset];
    let line = before.iter().filter(|b| **b == b'\n').count() + 1;
    let column = before.iter().rev().take_while(|b| **b != b'\n').count() + 1;
    (line, column)
}

/// The cache file cannot be trusted. Fatal for hydration of that file; the
/// scanner recovers by performing a full rebuild.
#[derive(Debug, thiserror::Error)]
pub enum CacheIntegrityError {
    #[error("cache file {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("cache schema {found} is newer than supported schema {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("cache is missing its schema header")]
    MissingHeader,

    #[error("malformed cache line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("dependency {dep} references repository {repo} which is not in the snapshot")]
    OrphanDependency { dep: u32, repo: u32 },

    #[error("cache summary {key} records {recorded} but rows contain {actual}")]
    TotalsMismatch {
        key: String,
        recorded: usize,
        actual: usize,
    },

    #[error("failed to read cache: {0}")]
    Io(#[from] io::Error),
}

/// Persisting the cache failed. Scan results are still returned in memory.
#[derive(Debug, thiserror::Error)]
#[error("failed to write cache {}: {source}", .path.display())]
pub struct CacheWriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Top-level error for operations that cannot degrade to a per-unit status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scan root {} is not a directory", .0.display())]
    InvalidRoot(PathBuf),

    #[error(transparent)]
    CacheIntegrity(#[from] CacheIntegrityError),

    #[error(transparent)]
    CacheWrite(#[from] CacheWriteError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
