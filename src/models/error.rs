use thiserror::Error;

/// Error taxonomy for the synchronization core.
///
/// `NotFound` is only fatal where the caller says so: a missing remote
/// archive means "no prior state", a missing file on `getFile` is a plain
/// error reply to the requester.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network failure talking to the remote blob store.
    #[error("storage transport error: {0}")]
    Transport(String),

    /// The requested archive or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local filesystem failure.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Malformed or out-of-state wire message, or a bad CRDT delta.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Packing or unpacking a workspace archive failed.
    #[error("archive error: {0}")]
    Archive(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
