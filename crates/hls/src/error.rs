/// Errors raised while turning playlist text into the typed model.
#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("missing #EXTM3U header")]
    MissingHeader,

    #[error("failed to parse playlist: {reason}")]
    Parse { reason: String },

    #[error("expected a media playlist but found a master playlist")]
    UnexpectedMaster,

    #[error("expected a master playlist but found a media playlist")]
    UnexpectedMedia,

    #[error("invalid IV `{value}`: {reason}")]
    InvalidIv { value: String, reason: String },
}

impl PlaylistError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }
}
