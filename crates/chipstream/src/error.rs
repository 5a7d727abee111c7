//! Library-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Library-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Output path collision: {} and {} both map to {}", first.display(), second.display(), output.display())]
    OutputCollision {
        first: PathBuf,
        second: PathBuf,
        output: PathBuf,
    },

    #[error("Invalid pipeline identifier: {0}")]
    InvalidPipelineId(String),

    #[error("Job manager is busy: {0}")]
    Busy(&'static str),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Batch worker failed: {0}")]
    Worker(String),

    #[error("Index {index} out of range for queue of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Whether the error was raised before any work started (bad input rather
    /// than a failed execution).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::OutputCollision { .. } | Self::InvalidPipelineId(_)
        )
    }

    /// Render the error together with its whole `source()` chain.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}
