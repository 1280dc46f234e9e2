use hls::{PlaylistError, QualityFilterError};
use mesio::{HttpError, StreamError};
use thiserror::Error;

use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no plugin can handle URL: {url}")]
    NoPlugin { url: String },

    /// Recoverable failure while resolving; the caller may retry.
    #[error("plugin error: {reason}")]
    Plugin { reason: String },

    /// Unrecoverable, e.g. a login is required.
    #[error("fatal plugin error: {reason}")]
    Fatal { reason: String },

    #[error("no playable streams found on URL: {url}")]
    NoStreams { url: String },

    #[error("invalid plugin definition `{name}`: {reason}")]
    InvalidPlugin { name: String, reason: String },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    pub fn plugin(reason: impl Into<String>) -> Self {
        Self::Plugin {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<PlaylistError> for PluginError {
    fn from(err: PlaylistError) -> Self {
        Self::Stream(err.into())
    }
}

impl From<QualityFilterError> for PluginError {
    fn from(err: QualityFilterError) -> Self {
        Self::plugin(err.to_string())
    }
}
