// HLS playlist reloader: picks the start position, reloads the media
// playlist on its cadence and enqueues every new segment in order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hls::{DateRange, MediaPlaylist, Playlist, PlaylistError, Segment, parse_playlist};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::config::{HlsOptions, ReloadTime};
use super::fetcher::HlsFetcher;
use crate::error::{HttpError, StreamError};
use crate::retry::RetryPolicy;
use crate::segmented::{SegmentQueue, SegmentedWorker};

/// Reload interval used when the playlist gives nothing better.
const FALLBACK_RELOAD: Duration = Duration::from_secs(6);
/// Upper bound of the reload back-off.
const MAX_RELOAD_BACKOFF: Duration = Duration::from_secs(300);
/// Lower bound of the "no new segments" window.
const MIN_STALL_WINDOW: Duration = Duration::from_secs(5);

/// One segment handed from the reloader to the writer.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub segment: Segment,
    /// URL of the media playlist the segment came from.
    pub base: Arc<Url>,
    /// Date ranges of that playlist.
    pub date_ranges: Arc<[DateRange]>,
}

/// Index of the first segment when joining a live playlist of `count` segments.
pub fn live_edge_index(count: usize, live_edge: usize) -> usize {
    count.saturating_sub(live_edge.max(1))
}

/// First segment whose preceding cumulative duration reaches `offset`.
fn offset_index(segments: &[Segment], offset: Duration) -> usize {
    let target = offset.as_secs_f64();
    let mut elapsed = 0.0;
    for (index, segment) in segments.iter().enumerate() {
        if elapsed >= target {
            return index;
        }
        elapsed += segment.duration;
    }
    segments.len().saturating_sub(1)
}

/// Fetch and parse a media playlist once.
pub(crate) async fn load_media_playlist<F: HlsFetcher>(
    fetcher: &F,
    url: &Url,
    timeout: Duration,
) -> Result<(MediaPlaylist, Url), StreamError> {
    let fetched = tokio::time::timeout(timeout, fetcher.fetch_playlist(url, timeout))
        .await
        .map_err(|_| HttpError::Timeout {
            url: url.to_string(),
        })??;
    match parse_playlist(&fetched.body)? {
        Playlist::Media(playlist) => Ok((playlist, fetched.url)),
        Playlist::Master(_) => Err(PlaylistError::UnexpectedMaster.into()),
    }
}

pub struct HlsWorker<F> {
    fetcher: Arc<F>,
    url: Url,
    base: Option<Url>,
    options: Arc<HlsOptions>,
    initial: Option<MediaPlaylist>,
    last_sequence: Option<u64>,
    emitted: f64,
}

impl<F: HlsFetcher> HlsWorker<F> {
    /// `initial` is the playlist already loaded from `url` when the stream was opened.
    pub fn new(fetcher: Arc<F>, url: Url, initial: MediaPlaylist, options: Arc<HlsOptions>) -> Self {
        Self {
            fetcher,
            url,
            base: None,
            options,
            initial: Some(initial),
            last_sequence: None,
            emitted: 0.0,
        }
    }

    /// URL the initial playlist was served from after redirects.
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = Some(base);
        self
    }

    pub(crate) fn start_index(&self, playlist: &MediaPlaylist) -> usize {
        let count = playlist.segments.len();
        if self.options.live_restart && playlist.is_live() {
            return 0;
        }
        if let Some(offset) = self.options.start_offset {
            return offset_index(&playlist.segments, offset);
        }
        if playlist.is_live() {
            return live_edge_index(count, self.options.live_edge);
        }
        0
    }

    pub(crate) fn reload_interval(&self, playlist: &MediaPlaylist) -> Duration {
        let target = playlist.target_duration;
        let last = playlist.segments.last().map(|s| s.duration);
        let secs = match self.options.playlist_reload_time {
            ReloadTime::Fixed(interval) => return interval,
            ReloadTime::Default if target > 0.0 => target,
            ReloadTime::Default => last.unwrap_or(0.0),
            ReloadTime::Segment => last.unwrap_or(target),
            ReloadTime::LiveEdge => target / 2.0,
        };
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(FALLBACK_RELOAD)
    }

    /// How long a live playlist may go without new segments.
    fn stall_window(&self, playlist: &MediaPlaylist) -> Option<Duration> {
        let threshold = self.options.segment_queue_threshold;
        if threshold <= 0.0 {
            return None;
        }
        let window = Duration::try_from_secs_f64(playlist.target_duration * threshold).unwrap_or_default();
        Some(window.max(MIN_STALL_WINDOW))
    }

    /// Segments of `playlist` not enqueued yet.
    pub(crate) fn select_segments(&self, playlist: &MediaPlaylist) -> Vec<Segment> {
        let Some(last) = self.last_sequence else {
            let start = self.start_index(playlist);
            return playlist.segments[start..].to_vec();
        };
        let Some(newest) = playlist.last_sequence() else {
            return Vec::new();
        };

        if newest < last {
            warn!(
                last_msn = last,
                newest_msn = newest,
                "Media sequence went backwards, realigning to the live edge"
            );
            let start = live_edge_index(playlist.segments.len(), self.options.live_edge);
            return playlist.segments[start..].to_vec();
        }
        if let Some(first) = playlist.first_sequence()
            && first > last + 1
        {
            warn!(
                missed = first - last - 1,
                from_msn = last + 1,
                "Segments expired before they were queued, skipping ahead"
            );
        }
        playlist
            .segments
            .iter()
            .filter(|s| s.sequence > last)
            .cloned()
            .collect()
    }

    /// Enqueue `segments`; returns false once the duration limit is reached.
    async fn enqueue(
        &mut self,
        playlist: &MediaPlaylist,
        base: &Arc<Url>,
        segments: Vec<Segment>,
        queue: &SegmentQueue<SegmentJob>,
    ) -> Result<bool, StreamError> {
        let limit = self.options.duration.map(|d| d.as_secs_f64());
        let date_ranges: Arc<[DateRange]> = playlist.date_ranges.clone().into();

        for segment in segments {
            if limit.is_some_and(|limit| self.emitted >= limit) {
                return Ok(false);
            }
            let sequence = segment.sequence;
            let duration = segment.duration;
            trace!(msn = sequence, uri = %segment.uri, "Queueing segment");
            let job = SegmentJob {
                segment,
                base: base.clone(),
                date_ranges: date_ranges.clone(),
            };
            if !queue.put(job).await {
                return Err(StreamError::Closed);
            }
            self.last_sequence = Some(sequence);
            self.emitted += duration;
        }
        Ok(!limit.is_some_and(|limit| self.emitted >= limit))
    }

    /// Reload until success, backing off after failures.
    ///
    /// `Ok(None)` means the attempts ran out and the stream should end.
    async fn reload(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<(MediaPlaylist, Url)>, StreamError> {
        let backoff = RetryPolicy {
            max_retries: self.options.playlist_reload_attempts,
            base_delay: interval,
            max_delay: MAX_RELOAD_BACKOFF,
            jitter: false,
        };
        let mut failures: u32 = 0;
        let mut delay = interval;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamError::Closed),
                result = load_media_playlist(self.fetcher.as_ref(), &self.url, self.options.playlist_timeout) => result,
            };
            match result {
                Ok(loaded) => return Ok(Some(loaded)),
                Err(e @ StreamError::Playlist(PlaylistError::UnexpectedMaster)) => return Err(e),
                Err(e) => {
                    failures += 1;
                    if failures >= self.options.playlist_reload_attempts {
                        warn!(
                            attempts = failures,
                            error = %e,
                            "Giving up on playlist reloads, ending stream"
                        );
                        return Ok(None);
                    }
                    delay = backoff.delay_for_attempt(failures - 1);
                    warn!(
                        attempt = failures,
                        max = self.options.playlist_reload_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to reload playlist"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<F: HlsFetcher> SegmentedWorker for HlsWorker<F> {
    type Segment = SegmentJob;

    async fn run(
        &mut self,
        queue: &SegmentQueue<SegmentJob>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let mut playlist = match self.initial.take() {
            Some(playlist) => playlist,
            None => load_media_playlist(self.fetcher.as_ref(), &self.url, self.options.playlist_timeout).await?.0,
        };
        let mut base = Arc::new(self.base.take().unwrap_or_else(|| self.url.clone()));
        let mut last_new = Instant::now();

        info!(
            url = %self.url,
            live = playlist.is_live(),
            segments = playlist.segments.len(),
            "HLS worker started"
        );

        loop {
            let segments = self.select_segments(&playlist);
            if !segments.is_empty() {
                debug!(
                    first_msn = segments[0].sequence,
                    count = segments.len(),
                    "New segments in playlist"
                );
                last_new = Instant::now();
            }
            if !self.enqueue(&playlist, &base, segments, queue).await? {
                info!(seconds = self.emitted, "Reached the configured duration, stopping");
                return Ok(());
            }
            if playlist.end_list {
                info!("Playlist ended");
                return Ok(());
            }
            if let Some(window) = self.stall_window(&playlist)
                && last_new.elapsed() >= window
            {
                info!(
                    seconds = window.as_secs_f64(),
                    "No new segments in playlist, ending stream"
                );
                return Ok(());
            }

            let interval = self.reload_interval(&playlist);
            trace!(interval_ms = interval.as_millis() as u64, "Waiting for next reload");
            match self.reload(interval, cancel).await? {
                Some((next, url)) => {
                    playlist = next;
                    if *base.as_ref() != url {
                        base = Arc::new(url);
                    }
                }
                None => return Ok(()),
            }
        }
    }
}
