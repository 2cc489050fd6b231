use std::path::PathBuf;

use thiserror::Error;

/// Failures a single source can hit during an ingestion cycle.
///
/// An empty extraction is deliberately absent here: it is reported on the
/// per-source outcome and answered with the fallback record set.
#[derive(Debug, Error)]
pub enum IngestError {
    /// HTTP or transport failure after retries are exhausted. `status` is
    /// `None` when no response was ever received.
    #[error("fetch failed for {url} (status {status:?}): {message}")]
    Fetch {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("no source url configured and no snapshot at {}", .0.display())]
    NotFound(PathBuf),

    #[error("store write failed: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    pub fn fetch(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        IngestError::Fetch {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by a fetch failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            IngestError::Fetch { status, .. } => *status,
            _ => None,
        }
    }
}
