//! Common error types for vegvisir.

use std::path::PathBuf;

use thiserror::Error;

use crate::family::ModelFamily;

/// Errors that can occur while resolving model artifacts.
#[derive(Debug, Error)]
pub enum VegvisirError {
    /// Configured models root, model directory, or required component
    /// directory is absent.
    #[error("directory not found: {path:?}")]
    DirectoryNotFound { path: PathBuf },

    /// Component directory contains no recognized weight file.
    #[error("no .safetensors or .bin file found in {dir:?}")]
    NoWeightFile { dir: PathBuf },

    /// No classification rule matched and the folder shape fits no family.
    #[error("could not determine model family for {dir:?}")]
    UnknownFamily { dir: PathBuf },

    /// The folder shape is shared by several families and no explicit
    /// family was supplied.
    #[error("ambiguous model family for {dir:?}: matches {candidates:?}")]
    AmbiguousFamily {
        dir: PathBuf,
        candidates: &'static [ModelFamily],
    },

    /// A requested shard part is missing from the component directory.
    #[error("shard {part} of {total} not found in {dir:?}")]
    ShardNotFound {
        dir: PathBuf,
        part: usize,
        total: usize,
    },

    /// Filesystem permission failure. The resolver quarantines the
    /// offending directory but always surfaces this error unchanged.
    #[error("permission denied: {path:?}")]
    PermissionDenied { path: PathBuf },

    /// Buffer reservation failed. Surfaced only after the single
    /// clear-cache-and-retry cycle.
    #[error("out of memory reserving {wanted} bytes")]
    OutOfMemory { wanted: usize },

    /// Malformed `model_index.json`.
    #[error("failed to parse manifest {path:?}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed `*.safetensors.index.json`.
    #[error("failed to parse shard index {path:?}")]
    ShardIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Any other filesystem failure, with the offending path attached.
    #[error("io error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Weight container could not be parsed or written.
    #[error("failed to load weight file {path:?}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl VegvisirError {
    /// Wraps an io error, routing `PermissionDenied` to its own variant so
    /// callers can match on it.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { path }
        } else {
            Self::Io { path, source }
        }
    }
}

/// Result type for vegvisir operations.
pub type Result<T> = std::result::Result<T, VegvisirError>;
