// HLS segment processor: fetches segments (with retries, init sections and
// AES-128 keys) and writes them to the output buffer in playlist order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use hls::{ByteRange, Key, KeyMethod, Map};
use moka::future::Cache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use url::Url;

use super::config::HlsOptions;
use super::decryption::{KeyCache, KeyUriTemplate, decrypt_segment, sequence_iv};
use super::fetcher::{HlsFetcher, SegmentBody};
use super::filter::{IgnoreNamesFilter, SegmentFilter};
use super::worker::SegmentJob;
use crate::buffer::RingBuffer;
use crate::error::{HttpError, StreamError};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::segmented::SegmentProcessor;

const SEGMENT_RETRY_BASE: Duration = Duration::from_millis(500);
const SEGMENT_RETRY_MAX: Duration = Duration::from_secs(5);

/// A fetched segment, ready to be written.
#[derive(Debug)]
pub struct HlsOutput {
    /// Init section of the segment with its bytes.
    pub map: Option<(Arc<Map>, Bytes)>,
    pub body: SegmentBody,
}

#[derive(Debug, Default)]
struct WriterState {
    last_map: Option<Arc<Map>>,
}

pub struct HlsProcessor<F> {
    fetcher: Arc<F>,
    options: Arc<HlsOptions>,
    filters: Vec<Arc<dyn SegmentFilter>>,
    keys: KeyCache,
    maps: Cache<(String, Option<ByteRange>), Bytes>,
    key_uri: Option<KeyUriTemplate>,
    state: Mutex<WriterState>,
}

impl<F: HlsFetcher> HlsProcessor<F> {
    pub fn new(fetcher: Arc<F>, options: Arc<HlsOptions>) -> Self {
        let mut filters: Vec<Arc<dyn SegmentFilter>> = Vec::new();
        let ignore = IgnoreNamesFilter::new(&options.segment_ignore_names);
        if ignore.is_active() {
            filters.push(Arc::new(ignore));
        }
        let key_uri = options.segment_key_uri.as_deref().map(KeyUriTemplate::new);
        Self {
            fetcher,
            options,
            filters,
            keys: KeyCache::new(),
            maps: Cache::builder().max_capacity(16).build(),
            key_uri,
            state: Mutex::new(WriterState::default()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn SegmentFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.options.segment_attempts.saturating_sub(1),
            base_delay: SEGMENT_RETRY_BASE,
            max_delay: SEGMENT_RETRY_MAX,
            jitter: true,
        }
    }

    /// Fetch a segment or init section, retrying transient failures.
    async fn fetch_body(
        &self,
        url: &Url,
        byte_range: Option<ByteRange>,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<SegmentBody, HttpError> {
        let timeout = self.options.segment_timeout;
        retry_with_backoff(&self.retry_policy(), cancel, |attempt| async move {
            if attempt > 0 {
                debug!(url = %url, attempt, "Retrying segment fetch");
            }
            let result = tokio::time::timeout(
                timeout,
                self.fetcher.fetch_segment(url, byte_range, timeout, streaming),
            )
            .await
            .unwrap_or_else(|_| {
                Err(HttpError::Timeout {
                    url: url.to_string(),
                })
            });
            RetryAction::from_http(result)
        })
        .await
    }

    async fn fetch_bytes(
        &self,
        url: &Url,
        byte_range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, HttpError> {
        match self.fetch_body(url, byte_range, false, cancel).await? {
            SegmentBody::Full(data) => Ok(data),
            SegmentBody::Chunks(mut chunks) => {
                let mut data = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    data.extend_from_slice(&chunk?);
                }
                Ok(data.freeze())
            }
        }
    }

    async fn fetch_map(
        &self,
        base: &Url,
        map: &Map,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StreamError> {
        let url = base
            .join(&map.uri)
            .map_err(|e| HttpError::invalid_url(&map.uri, e.to_string()))?;
        self.maps
            .try_get_with((url.to_string(), map.byte_range), async {
                trace!(url = %url, "Fetching init section");
                self.fetch_bytes(&url, map.byte_range, cancel).await
            })
            .await
            .map_err(|e| StreamError::other(format!("init section {url}: {e}")))
    }

    async fn decrypt(
        &self,
        job: &SegmentJob,
        key: &Key,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, StreamError> {
        let uri = key
            .uri
            .as_deref()
            .ok_or_else(|| StreamError::decryption("AES-128 key without URI"))?;
        let mut key_url = job
            .base
            .join(uri)
            .map_err(|e| HttpError::invalid_url(uri, e.to_string()))?;
        if let Some(template) = &self.key_uri {
            let rewritten = template.apply(&key_url);
            key_url = Url::parse(&rewritten)
                .map_err(|e| HttpError::invalid_url(&rewritten, e.to_string()))?;
        }

        let timeout = self.options.segment_timeout;
        let fetcher = self.fetcher.as_ref();
        let policy = self.retry_policy();
        let key_url = &key_url;
        let key_bytes = self
            .keys
            .get_or_fetch(key_url.as_str(), key.iv, move || async move {
                retry_with_backoff(&policy, cancel, |_| async move {
                    RetryAction::from_http(fetcher.fetch_key(key_url, timeout).await)
                })
                .await
                .map_err(StreamError::from)
            })
            .await?;

        let iv = key.iv.unwrap_or_else(|| sequence_iv(job.segment.sequence));
        decrypt_segment(&data, &key_bytes, &iv)
    }

    /// Copy a streamed body into the buffer.
    ///
    /// Only the wait for each chunk is timed, never the wait for buffer
    /// space. A body that fails or stalls is requested again from the first
    /// byte not yet written, up to `segment_attempts` times; after that the
    /// segment fails.
    async fn write_streamed(
        &self,
        job: &SegmentJob,
        mut chunks: BoxStream<'static, Result<Bytes, HttpError>>,
        buffer: &RingBuffer,
    ) -> Result<(), StreamError> {
        let segment = &job.segment;
        let mut written = 0u64;
        let mut attempt = 1;
        loop {
            let failure = match tokio::time::timeout(self.options.segment_timeout, chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    write_all(buffer, &chunk).await?;
                    written += chunk.len() as u64;
                    continue;
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => e,
                Err(_) => HttpError::Timeout {
                    url: segment.uri.clone(),
                },
            };
            if segment.byte_range.is_some_and(|r| written >= r.length) {
                return Ok(());
            }

            if attempt >= self.options.segment_attempts {
                error!(msn = segment.sequence, written, error = %failure, "Segment body failed, giving up");
                return Err(failure.into());
            }
            attempt += 1;
            warn!(msn = segment.sequence, written, attempt, error = %failure, "Segment body interrupted, resuming");

            let url = job
                .base
                .join(&segment.uri)
                .map_err(|e| HttpError::invalid_url(&segment.uri, e.to_string()))?;
            let range = remaining_range(segment.byte_range, written);
            let cancel = buffer.close_token();
            let body = self
                .fetch_body(&url, Some(range), true, &cancel)
                .await
                .map_err(|e| match e {
                    HttpError::Cancelled => StreamError::Closed,
                    e => e.into(),
                })?;
            chunks = match body {
                SegmentBody::Chunks(chunks) => chunks,
                SegmentBody::Full(data) => {
                    write_all(buffer, &data).await?;
                    return Ok(());
                }
            };
        }
    }
}

/// What is left of a segment after `written` bytes of it were delivered.
fn remaining_range(range: Option<ByteRange>, written: u64) -> ByteRange {
    match range {
        Some(range) => ByteRange {
            length: range.length.saturating_sub(written),
            offset: range.offset + written,
        },
        // Open-ended: a last position past the end means "until the end".
        None => ByteRange {
            length: u64::MAX - written,
            offset: written,
        },
    }
}

async fn write_all(buffer: &RingBuffer, data: &[u8]) -> Result<(), StreamError> {
    if buffer.write(data).await < data.len() {
        return Err(StreamError::Closed);
    }
    Ok(())
}

#[async_trait]
impl<F: HlsFetcher> SegmentProcessor for HlsProcessor<F> {
    type Segment = SegmentJob;
    type Output = HlsOutput;

    fn should_filter(&self, job: &SegmentJob) -> bool {
        self.filters.iter().any(|f| f.should_filter(job))
    }

    async fn fetch(&self, job: &SegmentJob, cancel: &CancellationToken) -> Option<HlsOutput> {
        if cancel.is_cancelled() {
            return None;
        }
        let segment = &job.segment;
        let url = match job.base.join(&segment.uri) {
            Ok(url) => url,
            Err(e) => {
                warn!(msn = segment.sequence, uri = %segment.uri, error = %e, "Invalid segment URI, skipping");
                return None;
            }
        };

        let key = segment.encryption();
        if let Some(key) = key
            && key.method != KeyMethod::Aes128
        {
            error!(msn = segment.sequence, method = ?key.method, "Unsupported segment encryption, skipping");
            return None;
        }

        let map = match &segment.map {
            Some(map) => match self.fetch_map(&job.base, map, cancel).await {
                Ok(bytes) => Some((map.clone(), bytes)),
                Err(e) => {
                    warn!(msn = segment.sequence, error = %e, "Failed to fetch init section, skipping segment");
                    return None;
                }
            },
            None => None,
        };

        let body = match key {
            Some(key) => {
                let data = match self.fetch_bytes(&url, segment.byte_range, cancel).await {
                    Ok(data) => data,
                    Err(HttpError::Cancelled) => return None,
                    Err(e) => {
                        warn!(msn = segment.sequence, error = %e, "Failed to fetch segment, skipping");
                        return None;
                    }
                };
                match self.decrypt(job, key, data, cancel).await {
                    Ok(plain) => SegmentBody::Full(plain),
                    Err(e) => {
                        warn!(msn = segment.sequence, error = %e, "Failed to decrypt segment, skipping");
                        return None;
                    }
                }
            }
            None => {
                let streaming = self.options.segment_stream_data;
                match self.fetch_body(&url, segment.byte_range, streaming, cancel).await {
                    Ok(body) => body,
                    Err(HttpError::Cancelled) => return None,
                    Err(e) => {
                        warn!(msn = segment.sequence, error = %e, "Failed to fetch segment, skipping");
                        return None;
                    }
                }
            }
        };

        trace!(msn = segment.sequence, "Segment fetched");
        Some(HlsOutput { map, body })
    }

    async fn write(
        &self,
        job: &SegmentJob,
        output: HlsOutput,
        buffer: &RingBuffer,
    ) -> Result<(), StreamError> {
        let segment = &job.segment;

        if let Some((map, bytes)) = output.map {
            let emit = {
                let mut state = self.state.lock();
                let changed = state.last_map.as_ref().is_none_or(|last| **last != *map);
                state.last_map = Some(map);
                changed || segment.discontinuity
            };
            if emit {
                if segment.discontinuity {
                    debug!(msn = segment.sequence, "Discontinuity, writing init section again");
                }
                write_all(buffer, &bytes).await?;
            }
        }

        match output.body {
            SegmentBody::Full(data) => write_all(buffer, &data).await?,
            SegmentBody::Chunks(chunks) => self.write_streamed(job, chunks, buffer).await?,
        }

        trace!(msn = segment.sequence, "Segment written");
        Ok(())
    }
}
