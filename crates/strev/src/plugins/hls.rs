//! `hls://`, `hlsvariant://` and bare `.m3u8` URLs.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use hls::PlaylistError;
use mesio::hls::HlsStream;
use mesio::{OptionMap, StreamContext, StreamError, StreamRef};
use regex::Regex;
use reqwest::header::HeaderMap;
use tracing::debug;

use super::{parse_params, with_scheme};
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};
use crate::registry::{LOW_PRIORITY, Matcher, NORMAL_PRIORITY, PluginDescriptor};

static PROTOCOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^hls(?:variant)?://(?P<url>\S+)(?:\s(?P<params>.+))?$").unwrap()
});
static M3U8_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<url>\S+\.m3u8(?:\?\S*)?)(?:\s(?P<params>.+))?$").unwrap()
});

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new("hls", |ctx| Ok(Box::new(HlsPlugin { ctx }) as Box<dyn Plugin>))
        .with_priority(NORMAL_PRIORITY)
        .with_matcher(Matcher::from_regex(PROTOCOL_RE.clone()).with_name("protocol"))
}

/// Plain playlist URLs, below any site plugin.
pub fn m3u8_descriptor() -> PluginDescriptor {
    PluginDescriptor::new("hls-url", |ctx| Ok(Box::new(HlsPlugin { ctx }) as Box<dyn Plugin>))
        .with_priority(LOW_PRIORITY)
        .with_matcher(Matcher::from_regex(M3U8_RE.clone()).with_name("playlist"))
}

pub struct HlsPlugin {
    ctx: PluginContext,
}

#[async_trait]
impl Plugin for HlsPlugin {
    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    async fn streams(&mut self) -> Result<Vec<(String, StreamRef)>, PluginError> {
        let url = self
            .ctx
            .capture("url")
            .map(with_scheme)
            .ok_or_else(|| PluginError::plugin("missing playlist URL"))?;
        let params = self
            .ctx
            .capture("params")
            .map(parse_params)
            .transpose()?
            .unwrap_or_default();
        hls_streams(&self.ctx.streams, &url, HeaderMap::new(), params).await
    }
}

/// Streams of a playlist URL: one per variant of a master playlist, or a
/// single `live` stream when the URL is already a media playlist.
pub async fn hls_streams(
    ctx: &StreamContext,
    url: &str,
    headers: HeaderMap,
    options: OptionMap,
) -> Result<Vec<(String, StreamRef)>, PluginError> {
    match HlsStream::parse_variant_playlist(ctx, url, headers.clone()).await {
        Ok(variants) => Ok(variants
            .into_iter()
            .map(|mut variant| {
                variant.stream = variant.stream.with_options(options.clone());
                (variant.name.clone(), variant.into_stream())
            })
            .collect()),
        Err(StreamError::Playlist(PlaylistError::UnexpectedMedia)) => {
            debug!(url, "Not a master playlist, using it as a single stream");
            let stream = HlsStream::new(ctx.clone(), url)
                .with_headers(headers)
                .with_options(options);
            Ok(vec![("live".to_string(), Arc::new(stream) as StreamRef)])
        }
        Err(err) => Err(err.into()),
    }
}
