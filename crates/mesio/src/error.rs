use hls::PlaylistError;
use reqwest::StatusCode;

/// Failures of the shared HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    Proxy { reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("connection to {url} failed: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    #[error("cookie jar I/O error: {source}")]
    CookieJar {
        #[from]
        source: std::io::Error,
    },

    #[error("cookie jar is not valid JSON: {source}")]
    CookieJarFormat {
        #[from]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn proxy(reason: impl Into<String>) -> Self {
        Self::Proxy {
            reason: reason.into(),
        }
    }

    /// Classify a transport error raised while talking to `url`.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if err.is_connect() {
            Self::Connection {
                url: url.to_string(),
                source: err,
            }
        } else if let Some(status) = err.status() {
            Self::Status {
                status,
                url: url.to_string(),
            }
        } else {
            Self::Request { source: err }
        }
    }

    /// Connection failures, timeouts and gateway/server errors are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Status { status, .. } => matches!(status.as_u16(), 500 | 502 | 503 | 504),
            Self::Request { source } => source.is_body() || source.is_request(),
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Proxy { .. }
            | Self::CookieJar { .. }
            | Self::CookieJarFormat { .. } => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Transport-level failures of opened streams.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("read timed out waiting for stream data")]
    ReadTimeout,

    #[error("stream cannot be represented as a URL")]
    NotRepresentable,

    #[error("stream is closed")]
    Closed,

    #[error("playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream failed: {reason}")]
    Other { reason: String },
}

impl StreamError {
    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }
}
