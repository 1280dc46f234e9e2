//! HLS transport.
//!
//! [`HlsStream`] opens a media playlist and hands it to the segmented
//! engine: [`HlsWorker`] reloads the playlist and queues new segments,
//! [`HlsProcessor`] fetches, decrypts and writes them in order.

mod config;
mod decryption;
mod fetcher;
mod filter;
mod stream;
mod worker;
mod writer;

pub use config::{HlsOptions, ReloadTime};
pub use decryption::{KeyCache, KeyUriTemplate, decrypt_segment, sequence_iv};
pub use fetcher::{FetchedPlaylist, HlsFetcher, HttpFetcher, SegmentBody};
pub use filter::{
    DateRangeAdFilter, IgnoreNamesFilter, SegmentFilter, SequenceRangeFilter, UriPatternFilter,
};
pub use stream::{HlsStream, HlsVariant, open_hls};
pub use worker::{HlsWorker, SegmentJob, live_edge_index};
pub use writer::{HlsOutput, HlsProcessor};
