//! Typed error hierarchy for the sorter.
//!
//! Configuration and I/O errors are recoverable and propagate to the CLI
//! boundary as a descriptive message. Invariant violations indicate a bug
//! in the pipeline itself, never a data condition, and carry enough
//! context (component, identifier) to diagnose after the fact.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("short {kind} on {path}: expected {expected} bytes, got {actual}")]
    ShortIo {
        path: PathBuf,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invariant violation in {component}: {detail}")]
    InvariantViolation { component: &'static str, detail: String },
}

impl SortError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SortError::Io { path: path.into(), source }
    }

    pub fn invariant(component: &'static str, detail: impl Into<String>) -> Self {
        SortError::InvariantViolation { component, detail: detail.into() }
    }
}

pub type SortResult<T> = Result<T, SortError>;
