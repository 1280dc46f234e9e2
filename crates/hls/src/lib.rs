// HLS (HTTP Live Streaming) playlist handling
pub mod error;
pub mod normalize;
pub mod playlist;
pub mod quality;

// Export common types for ease of use
pub use error::PlaylistError;
pub use normalize::normalize;
pub use playlist::{
    ByteRange, DateRange, Key, KeyMethod, Map, MasterPlaylist, MediaPlaylist, MediaType,
    Playlist, PlaylistType, Rendition, Resolution, Segment, Variant, parse_master_playlist,
    parse_media_playlist, parse_playlist,
};
pub use quality::{QualityFilterError, SortingFilter, name_variants, stream_weight};
