//! Shared helpers for unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use futures::StreamExt;
use hls::{ByteRange, MediaPlaylist};
use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

use crate::error::HttpError;
use crate::hls::{FetchedPlaylist, HlsFetcher, SegmentBody};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesio_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Media playlist text with `count` segments of `duration` starting at `first`.
pub fn live_playlist(first: u64, count: usize, duration: f64, end_list: bool) -> String {
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:{first}\n",
        duration.ceil() as u64
    );
    for sequence in first..first + count as u64 {
        text.push_str(&format!("#EXTINF:{duration:.3},\nsegment_{sequence}.ts\n"));
    }
    if end_list {
        text.push_str("#EXT-X-ENDLIST\n");
    }
    text
}

pub fn media_playlist(first: u64, count: usize, duration: f64, end_list: bool) -> MediaPlaylist {
    hls::parse_media_playlist(live_playlist(first, count, duration, end_list).as_bytes()).unwrap()
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Bytes {
    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    let len = cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .len();
    buffer.truncate(len);
    Bytes::from(buffer)
}

/// Scripted [`HlsFetcher`]: playlists are served in push order, segments and
/// keys by absolute URL. Anything unknown answers 404.
#[derive(Default)]
pub struct MockFetcher {
    playlists: Mutex<VecDeque<String>>,
    segments: Mutex<HashMap<String, Bytes>>,
    keys: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, u32>>,
    interruptions: Mutex<HashMap<String, u32>>,
    delays: Mutex<HashMap<String, Duration>>,
    playlist_requests: Mutex<usize>,
    segment_requests: Mutex<Vec<String>>,
    key_requests: Mutex<Vec<String>>,
}

fn status(status: StatusCode, url: &Url) -> HttpError {
    HttpError::Status {
        status,
        url: url.to_string(),
    }
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_playlist(&self, text: impl Into<String>) {
        self.playlists.lock().push_back(text.into());
    }

    pub fn add_segment(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.segments.lock().insert(url.into(), body.into());
    }

    pub fn add_key(&self, url: impl Into<String>, key: impl Into<Bytes>) {
        self.keys.lock().insert(url.into(), key.into());
    }

    /// Answer the next `times` requests for `url` with 503.
    pub fn fail_segment(&self, url: impl Into<String>, times: u32) {
        self.failures.lock().insert(url.into(), times);
    }

    /// Cut the next `times` streamed bodies of `url` after their first chunk.
    pub fn interrupt_segment(&self, url: impl Into<String>, times: u32) {
        self.interruptions.lock().insert(url.into(), times);
    }

    pub fn delay_segment(&self, url: impl Into<String>, delay: Duration) {
        self.delays.lock().insert(url.into(), delay);
    }

    pub fn playlist_requests(&self) -> usize {
        *self.playlist_requests.lock()
    }

    pub fn segment_requests(&self) -> Vec<String> {
        self.segment_requests.lock().clone()
    }

    pub fn key_requests(&self) -> Vec<String> {
        self.key_requests.lock().clone()
    }
}

#[async_trait]
impl HlsFetcher for MockFetcher {
    async fn fetch_playlist(&self, url: &Url, _timeout: Duration) -> Result<FetchedPlaylist, HttpError> {
        *self.playlist_requests.lock() += 1;
        let text = self
            .playlists
            .lock()
            .pop_front()
            .ok_or_else(|| status(StatusCode::NOT_FOUND, url))?;
        Ok(FetchedPlaylist {
            url: url.clone(),
            body: Bytes::from(text),
        })
    }

    async fn fetch_segment(
        &self,
        url: &Url,
        byte_range: Option<ByteRange>,
        _timeout: Duration,
        streaming: bool,
    ) -> Result<SegmentBody, HttpError> {
        let key = url.to_string();
        self.segment_requests.lock().push(key.clone());

        let delay = self.delays.lock().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&key)
                && *left > 0
            {
                *left -= 1;
                return Err(status(StatusCode::SERVICE_UNAVAILABLE, url));
            }
        }

        let body = self
            .segments
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| status(StatusCode::NOT_FOUND, url))?;
        let body = match byte_range {
            Some(range) => body.slice(range.offset as usize..(range.end() as usize).min(body.len())),
            None => body,
        };

        if streaming {
            let mid = body.len() / 2;
            let interrupted = {
                let mut interruptions = self.interruptions.lock();
                match interruptions.get_mut(&key) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            let tail = if interrupted {
                Err(HttpError::Timeout { url: key.clone() })
            } else {
                Ok(body.slice(mid..))
            };
            let chunks = vec![Ok(body.slice(..mid)), tail];
            return Ok(SegmentBody::Chunks(futures::stream::iter(chunks).boxed()));
        }
        Ok(SegmentBody::Full(body))
    }

    async fn fetch_key(&self, url: &Url, _timeout: Duration) -> Result<Bytes, HttpError> {
        self.key_requests.lock().push(url.to_string());
        self.keys
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| status(StatusCode::NOT_FOUND, url))
    }
}
