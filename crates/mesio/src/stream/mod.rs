//! Stream contract shared by every transport.
//!
//! A [`Stream`] is a cheap description of something playable. Calling
//! [`Stream::open`] starts the transport and returns a fresh
//! [`StreamReader`]; two opens never share transport state.

mod file;
mod http;
mod muxed;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::hls::HlsStream;
use crate::http::HttpSession;
use crate::options::{OptionMap, OptionValue, SharedOptions};

pub use file::FileStream;
pub use http::HttpStream;
pub use muxed::{Muxer, MuxedStream};

/// Sequential binary reader returned by [`Stream::open`].
#[async_trait]
pub trait StreamReader: Send {
    /// Read up to `n` bytes. Empty bytes mean a clean end of stream.
    async fn read(&mut self, n: usize) -> Result<Bytes, StreamError>;

    /// Stop background work. Idempotent.
    async fn close(&mut self);
}

pub type BoxReader = Box<dyn StreamReader>;

/// Drain `reader` until end of stream.
pub async fn read_to_end(reader: &mut dyn StreamReader) -> Result<Bytes, StreamError> {
    let mut out = BytesMut::new();
    loop {
        let chunk = reader.read(64 * 1024).await?;
        if chunk.is_empty() {
            return Ok(out.freeze());
        }
        out.extend_from_slice(&chunk);
    }
}

#[async_trait]
pub trait Stream: Send + Sync + fmt::Debug {
    /// Protocol tag, e.g. `hls` or `http`.
    fn shortname(&self) -> &'static str;

    async fn open(&self) -> Result<BoxReader, StreamError>;

    /// Effective transport URL.
    fn to_url(&self) -> Result<String, StreamError> {
        Err(StreamError::NotRepresentable)
    }

    /// Manifest the stream was derived from, if any.
    fn to_manifest_url(&self) -> Result<String, StreamError> {
        Err(StreamError::NotRepresentable)
    }

    /// Serialisable form, see [`StreamDescriptor::into_stream`].
    fn descriptor(&self) -> StreamDescriptor;
}

pub type StreamRef = Arc<dyn Stream>;

pub(crate) type MuxerSlot = Arc<RwLock<Option<Arc<dyn Muxer>>>>;

/// Session services handed to every stream.
#[derive(Clone)]
pub struct StreamContext {
    pub http: HttpSession,
    pub options: SharedOptions,
    muxer: MuxerSlot,
    plugin: Option<Arc<str>>,
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("plugin", &self.plugin)
            .field("muxer", &self.muxer.read().is_some())
            .finish_non_exhaustive()
    }
}

impl StreamContext {
    pub fn new(http: HttpSession, options: SharedOptions) -> Self {
        Self {
            http,
            options,
            muxer: Arc::new(RwLock::new(None)),
            plugin: None,
        }
    }

    /// Same services, options resolved in the namespace of `plugin`.
    pub fn with_plugin(&self, plugin: &str) -> Self {
        Self {
            plugin: Some(Arc::from(plugin)),
            ..self.clone()
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    /// Install the muxer used by [`MuxedStream`]. Shared by every clone.
    pub fn set_muxer(&self, muxer: Option<Arc<dyn Muxer>>) {
        *self.muxer.write() = muxer;
    }

    pub fn muxer(&self) -> Option<Arc<dyn Muxer>> {
        self.muxer.read().clone()
    }

    pub fn resolve_option(&self, key: &str, explicit: Option<&OptionMap>) -> Option<OptionValue> {
        self.options
            .read()
            .resolve(key, self.plugin.as_deref(), explicit)
    }
}

/// JSON form of a stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamDescriptor {
    Http {
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Hls {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        master: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    File {
        path: PathBuf,
    },
    Muxed {
        substreams: Vec<StreamDescriptor>,
    },
}

impl StreamDescriptor {
    /// Rebuild a stream bound to `ctx`.
    pub fn into_stream(self, ctx: &StreamContext) -> Result<StreamRef, StreamError> {
        let stream: StreamRef = match self {
            StreamDescriptor::Http {
                method,
                url,
                headers,
            } => {
                let method = method.parse().map_err(|_| {
                    StreamError::unsupported(format!("unknown HTTP method `{method}`"))
                })?;
                Arc::new(
                    HttpStream::new(ctx.clone(), url)
                        .with_method(method)
                        .with_headers(headers_from_map(&headers)?),
                )
            }
            StreamDescriptor::Hls {
                url,
                master,
                headers,
            } => {
                let mut stream = HlsStream::new(ctx.clone(), url).with_headers(headers_from_map(&headers)?);
                if let Some(master) = master {
                    stream = stream.with_master(master);
                }
                Arc::new(stream)
            }
            StreamDescriptor::File { path } => Arc::new(FileStream::new(path)),
            StreamDescriptor::Muxed { substreams } => {
                let substreams = substreams
                    .into_iter()
                    .map(|d| d.into_stream(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(MuxedStream::new(ctx.clone(), substreams))
            }
        };
        Ok(stream)
    }
}

pub(crate) fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub(crate) fn headers_from_map(map: &BTreeMap<String, String>) -> Result<HeaderMap, StreamError> {
    let mut headers = HeaderMap::with_capacity(map.len());
    for (name, value) in map {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| StreamError::InvalidOption {
            key: name.clone(),
            reason: e.to_string(),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| StreamError::InvalidOption {
            key: name.to_string(),
            reason: e.to_string(),
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}
