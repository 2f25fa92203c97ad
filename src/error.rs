//! Error types for the conversion core.
//!
//! Engine-level failures ([`ConversionError`]) stay inside the queue. Callers
//! only ever see a [`JobFailure`], whose two variants are the only failure
//! messages that cross the service boundary.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single conversion attempt against the engine.
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// The engine could not open or interpret the source document.
    #[error("unsupported input '{}': {detail}", path.display())]
    UnsupportedFormat { path: PathBuf, detail: String },

    /// Any other engine problem: crash, abnormal close, timeout, I/O.
    #[error("engine failure: {0}")]
    EngineFailure(String),
}

/// Retry classification of a [`ConversionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying can never succeed.
    UnsupportedFormat,
    /// A later attempt may succeed.
    EngineFailure,
}

impl ConversionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ConversionError::EngineFailure(_) => ErrorKind::EngineFailure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::EngineFailure
    }
}

/// Terminal, caller-facing outcome of a failed job.
///
/// The `Display` strings are what clients see; engine internals never leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("File format not supported")]
    NotSupported,

    #[error("Error converting file to PDF")]
    ConversionFailed,
}

/// The engine listener could not be started or never became usable.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine listener: {0}")]
    Launch(#[source] io::Error),

    #[error("engine listener on port {port} not accepting connections after {waited:?}")]
    NotReady { port: u16, waited: Duration },
}

/// An orphaned engine process survived a termination attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    #[error("engine process {pid} refused to terminate")]
    Refused { pid: u32 },
}
