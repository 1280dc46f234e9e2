//! # Mesio engine
//!
//! Transport side of the resolver: the bounded byte buffer, the filter gate,
//! the shared HTTP session, the options store, the [`Stream`] contract with
//! its HTTP, file and muxed implementations, the generic segmented pipeline,
//! and the HLS engine built on it.

pub mod buffer;
pub mod config;
pub mod cookies;
pub mod error;
pub mod filtered;
pub mod hls;
pub mod http;
pub mod options;
pub mod proxy;
pub mod retry;
pub mod segmented;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_utils;

pub use buffer::{BufferError, DEFAULT_BUFFER_SIZE, RingBuffer};
pub use config::HttpConfig;
pub use cookies::{Cookie, CookieJar};
pub use error::{HttpError, StreamError};
pub use filtered::{FilterGate, FilteredReader};
pub use self::hls::{HlsStream, HlsVariant};
pub use http::{HttpSession, RequestOptions, RequestTimeout};
pub use options::{OptionMap, OptionValue, Options, SharedOptions};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use retry::RetryPolicy;
pub use segmented::{SegmentedConfig, SegmentedReader};
pub use stream::{
    BoxReader, FileStream, HttpStream, MuxedStream, Muxer, Stream, StreamContext,
    StreamDescriptor, StreamReader, StreamRef, read_to_end,
};
