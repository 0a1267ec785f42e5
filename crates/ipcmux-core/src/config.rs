//! Configuration for multiplexers and spawned workers.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable a spawned worker sees when its stdio carries frames.
pub const CHANNEL_ENV: &str = "IPCMUX_CHANNEL";

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "IPCMUX_WORKER_PATH";

const WORKER_BINARY: &str = if cfg!(windows) {
    "ipcmux-worker.exe"
} else {
    "ipcmux-worker"
};

/// Multiplexer behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Deregister a worker automatically when its channel closes.
    pub auto_remove: bool,
}

impl MultiplexerConfig {
    /// Set whether closed workers are deregistered automatically.
    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }
}

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Program to execute.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub envs: Vec<(OsString, OsString)>,
}

impl SpawnConfig {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Launch the `ipcmux-worker` binary.
    pub fn worker() -> Result<Self> {
        Ok(Self::new(find_worker_binary()?))
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Find the ipcmux-worker binary path.
///
/// Looks in the following order:
/// 1. `IPCMUX_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/debug` or `target/release` of the workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(WORKER_BINARY);
        if worker_path.exists() {
            return Ok(worker_path);
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::WorkerNotFound(format!(
        "set {} or ensure {} is in PATH",
        WORKER_PATH_ENV, WORKER_BINARY
    )))
}
