//! # strev
//!
//! URL resolution on top of the mesio engine. A [`Session`] owns the HTTP
//! client, the options and a [`PluginRegistry`]; given a URL it picks one
//! plugin, asks it for streams, and returns them named by quality with the
//! `best`/`worst` aliases.
//!
//! ```rust,ignore
//! let session = Session::new()?;
//! session.set_option("hls-live-edge", 2i64)?;
//! let streams = session.streams("https://cdn.example.com/master.m3u8", StreamsOptions::default()).await?;
//! let mut reader = streams.get("best").unwrap().open().await?;
//! ```

pub mod error;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod session;
pub mod validate;

pub use error::PluginError;
pub use plugin::{Metadata, Plugin, PluginContext};
pub use registry::{
    HIGH_PRIORITY, HIGHEST_PRIORITY, LOW_PRIORITY, Matcher, NO_PRIORITY, NORMAL_PRIORITY,
    PluginDescriptor, PluginFactory, PluginMatch, PluginRegistry,
};
pub use session::{ResolvedUrl, Session, StreamMap, StreamsOptions, stream_to_json};
pub use validate::{ResponseSchema, Schema, ValidationError};
