//! Error types for QueueKing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures a caller of the queue service can observe.
///
/// Expected user-facing situations (already a member, nobody to let ahead,
/// queue already gone) are not errors; they come back as outcome enums from
/// [`crate::core::QueueService`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Deadline is in the past")]
    DeadlineInPast,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Telegram error: {0}")]
    Telegram(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl Error {
    /// Validation failures are rejected before any state changes and are
    /// safe to show to the user verbatim.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::DeadlineInPast)
    }
}
