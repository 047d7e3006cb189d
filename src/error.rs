//! Error types for every stage of the station pipeline.
//!
//! Only [`RadioError`] during start-up is fatal. Everything else is logged by
//! the loop that hit it, which then skips the file or ends the cycle early.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Radio setup failed: {0}")]
    Setup(String),

    #[error("Radio receive failed: {0}")]
    Receive(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Corrupt capture: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to open a session with the collector
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Authentication failed for user {user}")]
    Authentication { user: String },

    #[error("Timed out connecting to {host}")]
    TimedOut { host: String },

    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Authentication failures will not fix themselves within one retry sequence
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::Authentication { .. })
    }
}

/// Failure to transfer or clean up a single file
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => UploadError::PermissionDenied(e.to_string()),
            io::ErrorKind::NotFound => UploadError::NotFound(e.to_string()),
            _ => UploadError::Io(e),
        }
    }
}
