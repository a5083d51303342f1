use std::io;
use thiserror::Error;

/// Main error type for storage-supervisor operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] io::Error),

    #[error("Engine is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Engine exited: {0}")]
    ProcessExit(String),

    #[error("Error sending request to engine: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Engine server error: {0}")]
    ControlApi(String),

    #[error("Unexpected status code: {0}")]
    Status(u16),

    #[error("Error parsing engine response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine not reachable after {0} attempts")]
    NotReady(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// True for errors that abort a single mount but leave the batch policy to the caller
    pub fn is_config(&self) -> bool {
        matches!(self, StorageError::Config(_))
    }
}

/// Result type alias for storage-supervisor operations
pub type Result<T> = std::result::Result<T, StorageError>;
