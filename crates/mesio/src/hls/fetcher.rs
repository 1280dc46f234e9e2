// HLS fetcher: the network seam of the engine (playlists, segments, keys).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use hls::ByteRange;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use tracing::trace;
use url::Url;

use crate::error::HttpError;
use crate::http::{HttpSession, RequestOptions, RequestTimeout};

/// Body of a fetched segment.
pub enum SegmentBody {
    Full(Bytes),
    Chunks(BoxStream<'static, Result<Bytes, HttpError>>),
}

impl std::fmt::Debug for SegmentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            SegmentBody::Chunks(_) => f.write_str("Chunks"),
        }
    }
}

/// A fetched playlist and the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct FetchedPlaylist {
    pub url: Url,
    pub body: Bytes,
}

/// Single-attempt network operations; retries are the caller's job.
#[async_trait]
pub trait HlsFetcher: Send + Sync + 'static {
    async fn fetch_playlist(&self, url: &Url, timeout: Duration) -> Result<FetchedPlaylist, HttpError>;

    /// Fetch a segment body. A streaming body is only bounded up to the
    /// response headers; reading it is the caller's to time out.
    async fn fetch_segment(
        &self,
        url: &Url,
        byte_range: Option<ByteRange>,
        timeout: Duration,
        streaming: bool,
    ) -> Result<SegmentBody, HttpError>;

    async fn fetch_key(&self, url: &Url, timeout: Duration) -> Result<Bytes, HttpError>;
}

/// [`HlsFetcher`] over the session HTTP client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: HttpSession,
    headers: HeaderMap,
}

impl HttpFetcher {
    pub fn new(http: HttpSession, headers: HeaderMap) -> Self {
        Self { http, headers }
    }

    fn options(&self, timeout: Duration) -> RequestOptions {
        RequestOptions {
            headers: self.headers.clone(),
            timeout: RequestTimeout::Total(timeout),
            ..RequestOptions::default()
        }
    }
}

#[async_trait]
impl HlsFetcher for HttpFetcher {
    async fn fetch_playlist(&self, url: &Url, timeout: Duration) -> Result<FetchedPlaylist, HttpError> {
        let response = self.http.request(url.as_str(), self.options(timeout)).await?;
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(url.as_str(), e))?;
        trace!(url = %final_url, len = body.len(), "Fetched playlist");
        Ok(FetchedPlaylist {
            url: final_url,
            body,
        })
    }

    async fn fetch_segment(
        &self,
        url: &Url,
        byte_range: Option<ByteRange>,
        timeout: Duration,
        streaming: bool,
    ) -> Result<SegmentBody, HttpError> {
        let mut options = self.options(timeout);
        if streaming {
            options.timeout = RequestTimeout::Unbounded;
        }
        if let Some(range) = byte_range {
            let value = HeaderValue::from_str(&range.to_header_value())
                .map_err(|e| HttpError::invalid_url(url.as_str(), e.to_string()))?;
            options.headers.insert(RANGE, value);
        }
        let response = self.http.request(url.as_str(), options).await?;
        // A server that ignores `Range` answers 200 with the whole resource.
        let slice = byte_range.filter(|_| response.status() == StatusCode::OK);
        if let Some(range) = slice {
            trace!(url = %url, offset = range.offset, length = range.length, "Range ignored, slicing locally");
        }

        if streaming {
            let source = url.to_string();
            let chunks = response
                .bytes_stream()
                .map(move |item| item.map_err(|e| HttpError::from_reqwest(&source, e)))
                .boxed();
            return Ok(SegmentBody::Chunks(match slice {
                Some(range) => slice_chunks(chunks, range),
                None => chunks,
            }));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(url.as_str(), e))?;
        Ok(SegmentBody::Full(match slice {
            Some(range) => {
                let start = (range.offset as usize).min(body.len());
                let end = (range.end() as usize).min(body.len());
                body.slice(start..end)
            }
            None => body,
        }))
    }

    async fn fetch_key(&self, url: &Url, timeout: Duration) -> Result<Bytes, HttpError> {
        self.http.get_bytes(url.as_str(), self.options(timeout)).await
    }
}

/// Keep only the bytes of `range` from a body that starts at offset 0.
pub(crate) fn slice_chunks(
    chunks: BoxStream<'static, Result<Bytes, HttpError>>,
    range: ByteRange,
) -> BoxStream<'static, Result<Bytes, HttpError>> {
    chunks
        .scan((range.offset, range.length), |(skip, left), item| {
            let next = match item {
                _ if *left == 0 => None,
                Err(e) => Some(Some(Err(e))),
                Ok(mut chunk) => {
                    let dropped = (*skip).min(chunk.len() as u64);
                    *skip -= dropped;
                    let _ = chunk.split_to(dropped as usize);
                    let kept = (*left).min(chunk.len() as u64);
                    *left -= kept;
                    chunk.truncate(kept as usize);
                    Some((!chunk.is_empty()).then_some(Ok(chunk)))
                }
            };
            futures::future::ready(next)
        })
        .filter_map(futures::future::ready)
        .boxed()
}
