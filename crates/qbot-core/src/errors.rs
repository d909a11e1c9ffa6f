use std::path::PathBuf;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the monitor can
/// tell connection-level failures (retry / reconnect / pause) from the rest.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Expired or invalid session. Needs the external re-authentication flow.
    #[error("auth error: {0}")]
    Auth(String),

    #[error("account banned: {0}")]
    Banned(String),

    /// Transient network failure; worth retrying.
    #[error("transport error: {0}")]
    Transport(String),

    /// Account store rejected a change (duplicate or malformed record).
    #[error("account error: {0}")]
    Account(String),

    #[error("submission error: {0}")]
    Submission(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Errors that end a monitor instead of being retried.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Banned(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
