// HLS stream: the `Stream` facade over the segmented engine, and master
// playlist expansion into named variants.

use std::sync::Arc;

use async_trait::async_trait;
use hls::{KeyMethod, MediaType, Rendition, Variant, name_variants, parse_master_playlist};
use reqwest::header::HeaderMap;
use tracing::{debug, info};
use url::Url;

use super::config::HlsOptions;
use super::fetcher::{HlsFetcher, HttpFetcher};
use super::filter::SegmentFilter;
use super::worker::{HlsWorker, load_media_playlist};
use super::writer::HlsProcessor;
use crate::error::{HttpError, StreamError};
use crate::options::OptionMap;
use crate::segmented::{self, SegmentedConfig, SegmentedReader};
use crate::stream::{
    BoxReader, MuxedStream, Stream, StreamContext, StreamDescriptor, StreamRef, headers_to_map,
};

/// A media playlist played through the segmented engine.
#[derive(Debug, Clone)]
pub struct HlsStream {
    ctx: StreamContext,
    url: String,
    master: Option<String>,
    headers: HeaderMap,
    explicit: OptionMap,
    filters: Vec<Arc<dyn SegmentFilter>>,
}

impl HlsStream {
    pub fn new(ctx: StreamContext, url: impl Into<String>) -> Self {
        Self {
            ctx,
            url: url.into(),
            master: None,
            headers: HeaderMap::new(),
            explicit: OptionMap::new(),
            filters: Vec::new(),
        }
    }

    /// Master playlist this variant was selected from.
    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Options that win over session and plugin values for this stream only.
    pub fn with_options(mut self, options: OptionMap) -> Self {
        self.explicit.extend(options);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn SegmentFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Expand the master playlist at `url` into named variants.
    ///
    /// A media playlist fails with [`hls::PlaylistError::UnexpectedMedia`] so
    /// callers can fall back to a single [`HlsStream`].
    pub async fn parse_variant_playlist(
        ctx: &StreamContext,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Vec<HlsVariant>, StreamError> {
        let options = {
            let store = ctx.options.read();
            HlsOptions::resolve(&store, ctx.plugin(), None)?
        };
        let parsed = Url::parse(url).map_err(|e| HttpError::invalid_url(url, e.to_string()))?;
        let fetcher = HttpFetcher::new(ctx.http.clone(), headers.clone());
        let fetched = fetcher
            .fetch_playlist(&parsed, options.playlist_timeout)
            .await?;
        let master = parse_master_playlist(&fetched.body)?;

        let mut variants = Vec::new();
        for (name, variant) in name_variants(&master.variants) {
            let Ok(variant_url) = fetched.url.join(&variant.uri) else {
                debug!(uri = %variant.uri, "Skipping variant with invalid URI");
                continue;
            };
            let renditions = |kind: MediaType, group: Option<&str>| -> Vec<Rendition> {
                group
                    .map(|group| {
                        master
                            .renditions_in(&kind, group)
                            .filter(|r| r.uri.is_some())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let audio = renditions(MediaType::Audio, variant.audio.as_deref());
            let subtitles = if options.mux_subtitles {
                renditions(MediaType::Subtitles, variant.subtitles.as_deref())
            } else {
                Vec::new()
            };
            variants.push(HlsVariant {
                name,
                stream: HlsStream::new(ctx.clone(), variant_url)
                    .with_master(url)
                    .with_headers(headers.clone()),
                variant: variant.clone(),
                audio,
                subtitles,
                base: fetched.url.clone(),
            });
        }
        info!(url, count = variants.len(), "Parsed variant playlist");
        Ok(variants)
    }
}

#[async_trait]
impl Stream for HlsStream {
    fn shortname(&self) -> &'static str {
        "hls"
    }

    async fn open(&self) -> Result<BoxReader, StreamError> {
        let options = {
            let store = self.ctx.options.read();
            HlsOptions::resolve(&store, self.ctx.plugin(), Some(&self.explicit))?
        };
        let url = Url::parse(&self.url).map_err(|e| HttpError::invalid_url(&self.url, e.to_string()))?;
        let fetcher = Arc::new(HttpFetcher::new(self.ctx.http.clone(), self.headers.clone()));
        let reader = open_hls(fetcher, url, options, self.filters.clone()).await?;
        Ok(Box::new(reader))
    }

    fn to_url(&self) -> Result<String, StreamError> {
        Ok(self.url.clone())
    }

    fn to_manifest_url(&self) -> Result<String, StreamError> {
        self.master.clone().ok_or(StreamError::NotRepresentable)
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::Hls {
            url: self.url.clone(),
            master: self.master.clone(),
            headers: headers_to_map(&self.headers),
        }
    }
}

/// Load the media playlist and start the engine.
///
/// Problems with the playlist itself fail here, before any data is produced.
pub async fn open_hls<F: HlsFetcher>(
    fetcher: Arc<F>,
    url: Url,
    options: HlsOptions,
    filters: Vec<Arc<dyn SegmentFilter>>,
) -> Result<SegmentedReader, StreamError> {
    let (playlist, final_url) =
        load_media_playlist(fetcher.as_ref(), &url, options.playlist_timeout).await?;

    if let Some(key) = playlist
        .segments
        .iter()
        .filter_map(|s| s.encryption())
        .find(|k| k.method != KeyMethod::Aes128)
    {
        return Err(StreamError::unsupported(format!(
            "segment encryption method {:?}",
            key.method
        )));
    }

    info!(
        url = %url,
        live = playlist.is_live(),
        target_duration = playlist.target_duration,
        threads = options.segment_threads,
        "Opening HLS stream"
    );

    let options = Arc::new(options);
    let config = SegmentedConfig {
        threads: options.segment_threads,
        buffer_size: options.buffer_size,
        timeout: options.stream_timeout,
    };
    let worker = HlsWorker::new(fetcher.clone(), url, playlist, options.clone()).with_base(final_url);
    let processor = filters
        .into_iter()
        .fold(HlsProcessor::new(fetcher, options), HlsProcessor::with_filter);
    Ok(segmented::spawn(worker, processor, config))
}

/// One named entry of a master playlist.
#[derive(Debug, Clone)]
pub struct HlsVariant {
    pub name: String,
    pub stream: HlsStream,
    pub variant: Variant,
    /// Audio renditions of the variant's group that have their own playlist.
    pub audio: Vec<Rendition>,
    /// Subtitle renditions of the variant's group, collected when `mux-subtitles` is set.
    pub subtitles: Vec<Rendition>,
    base: Url,
}

impl HlsVariant {
    /// Rendition played alongside the variant: the default one, else the first autoselect one.
    pub fn preferred_audio(&self) -> Option<&Rendition> {
        self.audio
            .iter()
            .find(|r| r.default)
            .or_else(|| self.audio.iter().find(|r| r.autoselect))
    }

    /// The variant as a stream, muxed with its preferred audio rendition
    /// and subtitle renditions when a muxer is installed.
    pub fn into_stream(self) -> StreamRef {
        let ctx = self.stream.ctx.clone();
        let extra: Vec<Url> = self
            .preferred_audio()
            .into_iter()
            .chain(&self.subtitles)
            .filter_map(|r| r.uri.as_deref())
            .filter_map(|uri| self.base.join(uri).ok())
            .collect();
        if extra.is_empty() || ctx.muxer().is_none() {
            return Arc::new(self.stream);
        }

        let mut substreams: Vec<StreamRef> = Vec::with_capacity(extra.len() + 1);
        for url in extra {
            let mut rendition = HlsStream::new(ctx.clone(), url).with_headers(self.stream.headers.clone());
            if let Some(master) = &self.stream.master {
                rendition = rendition.with_master(master.clone());
            }
            substreams.push(Arc::new(rendition));
        }
        substreams.insert(0, Arc::new(self.stream));
        Arc::new(MuxedStream::new(ctx, substreams))
    }
}
