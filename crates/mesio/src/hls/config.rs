use std::time::Duration;

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::StreamError;
use crate::options::{OptionMap, OptionValue, Options};

/// How the interval between playlist reloads is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReloadTime {
    /// Target duration, falling back to the last segment's duration.
    Default,
    /// Duration of the last segment.
    Segment,
    /// Half the target duration.
    LiveEdge,
    Fixed(Duration),
}

impl ReloadTime {
    pub fn parse(value: &OptionValue) -> Result<Self, StreamError> {
        if let Some(s) = value.as_str() {
            match s.trim().to_ascii_lowercase().as_str() {
                "default" => return Ok(Self::Default),
                "segment" => return Ok(Self::Segment),
                "live-edge" => return Ok(Self::LiveEdge),
                _ => {}
            }
        }
        match value.as_duration() {
            Some(d) if !d.is_zero() => Ok(Self::Fixed(d)),
            _ => Err(StreamError::InvalidOption {
                key: "hls-playlist-reload-time".to_string(),
                reason: format!("expected default, segment, live-edge or seconds, got {value:?}"),
            }),
        }
    }
}

/// Typed snapshot of the HLS options, taken when a stream is opened.
#[derive(Debug, Clone)]
pub struct HlsOptions {
    pub live_edge: usize,
    pub live_restart: bool,
    pub playlist_reload_attempts: u32,
    pub playlist_reload_time: ReloadTime,
    pub playlist_timeout: Duration,
    /// Multiple of the target duration without new segments that ends a live stream. Zero disables it.
    pub segment_queue_threshold: f64,
    /// Total attempts per segment, including the first.
    pub segment_attempts: u32,
    pub segment_threads: usize,
    pub segment_timeout: Duration,
    pub segment_stream_data: bool,
    pub segment_ignore_names: Vec<String>,
    pub segment_key_uri: Option<String>,
    pub start_offset: Option<Duration>,
    pub duration: Option<Duration>,
    pub buffer_size: usize,
    pub stream_timeout: Option<Duration>,
    /// Mux the variant's subtitle renditions along with video and audio.
    pub mux_subtitles: bool,
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            live_edge: 3,
            live_restart: false,
            playlist_reload_attempts: 3,
            playlist_reload_time: ReloadTime::Default,
            playlist_timeout: Duration::from_secs(10),
            segment_queue_threshold: 3.0,
            segment_attempts: 3,
            segment_threads: 1,
            segment_timeout: Duration::from_secs(10),
            segment_stream_data: false,
            segment_ignore_names: Vec::new(),
            segment_key_uri: None,
            start_offset: None,
            duration: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stream_timeout: Some(Duration::from_secs(60)),
            mux_subtitles: false,
        }
    }
}

fn invalid(key: &str, value: &OptionValue) -> StreamError {
    StreamError::InvalidOption {
        key: key.to_string(),
        reason: format!("unexpected value {value:?}"),
    }
}

impl HlsOptions {
    /// Resolve every HLS option for a stream of `plugin`.
    pub fn resolve(
        options: &Options,
        plugin: Option<&str>,
        explicit: Option<&OptionMap>,
    ) -> Result<Self, StreamError> {
        let get = |key: &str| options.resolve(key, plugin, explicit);
        let defaults = Self::default();

        let usize_of = |key: &str, default: usize| -> Result<usize, StreamError> {
            match get(key) {
                None => Ok(default),
                Some(v) => v
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| invalid(key, &v)),
            }
        };
        let u32_of = |key: &str, default: u32| -> Result<u32, StreamError> {
            match get(key) {
                None => Ok(default),
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| invalid(key, &v)),
            }
        };
        let bool_of = |key: &str, default: bool| -> Result<bool, StreamError> {
            match get(key) {
                None => Ok(default),
                Some(v) => v.as_bool().ok_or_else(|| invalid(key, &v)),
            }
        };
        let duration_of = |key: &str| -> Result<Option<Duration>, StreamError> {
            match get(key) {
                None => Ok(None),
                Some(v) => v.as_duration().map(Some).ok_or_else(|| invalid(key, &v)),
            }
        };

        let playlist_reload_time = match get("hls-playlist-reload-time") {
            None => ReloadTime::Default,
            Some(v) => ReloadTime::parse(&v)?,
        };
        let segment_queue_threshold = match get("hls-segment-queue-threshold") {
            None => defaults.segment_queue_threshold,
            Some(v) => v
                .as_f64()
                .filter(|f| *f >= 0.0 && f.is_finite())
                .ok_or_else(|| invalid("hls-segment-queue-threshold", &v))?,
        };
        let segment_ignore_names = get("hls-segment-ignore-names")
            .and_then(|v| v.as_string_list())
            .unwrap_or_default();
        let segment_key_uri = get("hls-segment-key-uri")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());

        Ok(Self {
            live_edge: usize_of("hls-live-edge", defaults.live_edge)?.max(1),
            live_restart: bool_of("hls-live-restart", defaults.live_restart)?,
            playlist_reload_attempts: u32_of(
                "hls-playlist-reload-attempts",
                defaults.playlist_reload_attempts,
            )?
            .max(1),
            playlist_reload_time,
            playlist_timeout: duration_of("hls-playlist-timeout")?
                .unwrap_or(defaults.playlist_timeout),
            segment_queue_threshold,
            segment_attempts: u32_of("hls-segment-attempts", defaults.segment_attempts)?.max(1),
            segment_threads: usize_of("hls-segment-threads", defaults.segment_threads)?.clamp(1, 10),
            segment_timeout: duration_of("hls-segment-timeout")?.unwrap_or(defaults.segment_timeout),
            segment_stream_data: bool_of("hls-segment-stream-data", defaults.segment_stream_data)?,
            segment_ignore_names,
            segment_key_uri,
            start_offset: duration_of("hls-start-offset")?,
            duration: duration_of("hls-duration")?,
            buffer_size: usize_of("ringbuffer-size", defaults.buffer_size)?.max(1),
            stream_timeout: duration_of("stream-timeout")?.filter(|d| !d.is_zero()),
            mux_subtitles: bool_of("mux-subtitles", defaults.mux_subtitles)?,
        })
    }
}
