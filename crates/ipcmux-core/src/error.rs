//! Error types for ipcmux-core.

use thiserror::Error;

/// Result type for ipcmux-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised at the fallible edges of the crate (spawning workers,
/// reading frames).
///
/// The multiplexer's own operations never return these: malformed input is
/// dropped and failed sends are reported as `false`.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to spawn a worker process.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// An incoming frame exceeded the size limit.
    #[error("IPC frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker binary could not be located.
    #[error("worker binary not found: {0}")]
    WorkerNotFound(String),
}
