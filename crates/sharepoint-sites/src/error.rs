//! Error types for site registry and connection operations

use std::path::PathBuf;

/// Errors surfaced to callers of the registry and connections.
///
/// Nothing is retried locally; every failure propagates as-is.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(common::Error),

    #[error("site not found: {0}")]
    NotFound(String),

    #[error("invalid site registration: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] sharepoint_auth::Error),

    #[error("SharePoint returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("connection refused with status {0}, recheck site configuration")]
    ConnectionRefused(u16),

    #[error("local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    #[error("{name} not found in {folder}")]
    RemoteFileNotFound { folder: String, name: String },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::MissingSite(site) => Error::NotFound(site),
            other => Error::Config(other),
        }
    }
}

impl Error {
    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } | Error::ConnectionRefused(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for site operations.
pub type Result<T> = std::result::Result<T, Error>;
