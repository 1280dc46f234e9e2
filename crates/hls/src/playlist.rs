//! Typed playlist model.
//!
//! The tokenizer (`m3u8-rs`) reports tags where they appear. The engine wants
//! every segment to be self-describing, so the conversion here resolves the
//! scoping rules of the format:
//!
//! - `#EXT-X-KEY` applies to its segment and every following one until the
//!   next key tag; `METHOD=NONE` clears encryption.
//! - `#EXT-X-MAP` applies the same way.
//! - `#EXT-X-BYTERANGE` without an offset starts where the previous sub-range
//!   of the same resource ended.
//! - `#EXT-X-PROGRAM-DATE-TIME` is carried forward by adding durations.
//! - Sequence and discontinuity-sequence numbers are assigned per segment.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeDelta};
use tracing::{debug, warn};

use crate::error::PlaylistError;
use crate::normalize::{normalize, parse_attributes};

/// A resolved byte range. The offset is always known after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub method: KeyMethod,
    pub uri: Option<String>,
    /// Explicit IV from the tag. When absent the media sequence number is used.
    pub iv: Option<[u8; 16]>,
    pub key_format: Option<String>,
    pub key_format_versions: Option<String>,
}

impl Key {
    pub fn is_encrypted(&self) -> bool {
        self.method != KeyMethod::None
    }
}

/// Initialisation section declared by `#EXT-X-MAP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Map {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateRange {
    pub id: String,
    pub class: Option<String>,
    pub start_date: DateTime<FixedOffset>,
    pub end_date: Option<DateTime<FixedOffset>>,
    pub duration: Option<f64>,
}

impl DateRange {
    /// End of the range, from `END-DATE` or `START-DATE + DURATION`.
    pub fn end(&self) -> Option<DateTime<FixedOffset>> {
        self.end_date.or_else(|| {
            let duration = self.duration?;
            let delta = TimeDelta::try_milliseconds((duration * 1000.0) as i64)?;
            self.start_date.checked_add_signed(delta)
        })
    }

    /// Whether `time` falls inside `[start, end)`.
    pub fn contains(&self, time: DateTime<FixedOffset>) -> bool {
        match self.end() {
            Some(end) => time >= self.start_date && time < end,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: String,
    pub duration: f64,
    pub title: Option<String>,
    pub byte_range: Option<ByteRange>,
    /// Set when `#EXT-X-DISCONTINUITY` precedes this segment.
    pub discontinuity: bool,
    pub discontinuity_sequence: u64,
    pub key: Option<Arc<Key>>,
    pub map: Option<Arc<Map>>,
    pub date_time: Option<DateTime<FixedOffset>>,
}

impl Segment {
    /// The active key, if it actually encrypts.
    pub fn encryption(&self) -> Option<&Key> {
        self.key.as_deref().filter(|k| k.is_encrypted())
    }

    /// Last path component of the URI without its query string.
    pub fn name(&self) -> &str {
        let path = self.uri.split(['?', '#']).next().unwrap_or(&self.uri);
        path.rsplit('/').next().unwrap_or(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Event,
    Vod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub version: Option<usize>,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub end_list: bool,
    pub playlist_type: Option<PlaylistType>,
    pub segments: Vec<Segment>,
    pub date_ranges: Vec<DateRange>,
}

impl MediaPlaylist {
    /// A playlist without `#EXT-X-ENDLIST` is still growing.
    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.segments.first().map(|s| s.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub audio: Option<String>,
    pub video: Option<String>,
    pub subtitles: Option<String>,
    pub is_i_frame: bool,
}

const AUDIO_CODEC_PREFIXES: &[&str] = &["mp4a", "ac-3", "ec-3", "opus", "flac", "mp3", "alac"];

impl Variant {
    /// Variant that carries audio codecs only and no picture.
    pub fn is_audio_only(&self) -> bool {
        if self.resolution.is_some() || self.video.is_some() {
            return false;
        }
        match self.codecs.as_deref() {
            Some(codecs) => {
                let mut any = false;
                for codec in codecs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    any = true;
                    let codec = codec.to_ascii_lowercase();
                    if !AUDIO_CODEC_PREFIXES.iter().any(|p| codec.starts_with(p)) {
                        return false;
                    }
                }
                any
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
    Other(String),
}

/// Alternative rendition from `#EXT-X-MEDIA`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub media_type: MediaType,
    pub group_id: String,
    pub name: String,
    pub language: Option<String>,
    pub uri: Option<String>,
    pub default: bool,
    pub autoselect: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterPlaylist {
    pub version: Option<usize>,
    pub variants: Vec<Variant>,
    pub renditions: Vec<Rendition>,
}

impl MasterPlaylist {
    /// Renditions of `media_type` belonging to `group_id`.
    pub fn renditions_in<'a>(
        &'a self,
        media_type: &'a MediaType,
        group_id: &'a str,
    ) -> impl Iterator<Item = &'a Rendition> + 'a {
        self.renditions
            .iter()
            .filter(move |r| &r.media_type == media_type && r.group_id == group_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Parse playlist bytes into either a master or a media playlist.
pub fn parse_playlist(input: &[u8]) -> Result<Playlist, PlaylistError> {
    let text = String::from_utf8_lossy(input);
    let text = normalize(&text);
    if !text.starts_with("#EXTM3U") {
        return Err(PlaylistError::MissingHeader);
    }

    match m3u8_rs::parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => Ok(Playlist::Master(convert_master(pl))),
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => Ok(Playlist::Media(convert_media(pl)?)),
        Err(e) => Err(PlaylistError::parse(e.to_string())),
    }
}

pub fn parse_media_playlist(input: &[u8]) -> Result<MediaPlaylist, PlaylistError> {
    match parse_playlist(input)? {
        Playlist::Media(pl) => Ok(pl),
        Playlist::Master(_) => Err(PlaylistError::UnexpectedMaster),
    }
}

pub fn parse_master_playlist(input: &[u8]) -> Result<MasterPlaylist, PlaylistError> {
    match parse_playlist(input)? {
        Playlist::Master(pl) => Ok(pl),
        Playlist::Media(_) => Err(PlaylistError::UnexpectedMedia),
    }
}

fn convert_master(pl: m3u8_rs::MasterPlaylist) -> MasterPlaylist {
    let variants = pl
        .variants
        .into_iter()
        .map(|v| Variant {
            uri: v.uri,
            bandwidth: v.bandwidth,
            average_bandwidth: v.average_bandwidth,
            codecs: v.codecs,
            resolution: v.resolution.map(|r| Resolution {
                width: r.width,
                height: r.height,
            }),
            frame_rate: v.frame_rate.map(f64::from),
            audio: v.audio,
            video: v.video,
            subtitles: v.subtitles,
            is_i_frame: v.is_i_frame,
        })
        .collect();

    let renditions = pl
        .alternatives
        .into_iter()
        .map(|m| Rendition {
            media_type: match m.media_type {
                m3u8_rs::AlternativeMediaType::Audio => MediaType::Audio,
                m3u8_rs::AlternativeMediaType::Video => MediaType::Video,
                m3u8_rs::AlternativeMediaType::Subtitles => MediaType::Subtitles,
                m3u8_rs::AlternativeMediaType::ClosedCaptions => MediaType::ClosedCaptions,
                #[allow(unreachable_patterns)]
                other => MediaType::Other(format!("{other:?}")),
            },
            group_id: m.group_id,
            name: m.name,
            language: m.language,
            uri: m.uri,
            default: m.default,
            autoselect: m.autoselect,
        })
        .collect();

    MasterPlaylist {
        version: pl.version,
        variants,
        renditions,
    }
}

fn convert_key(key: &m3u8_rs::Key) -> Result<Key, PlaylistError> {
    let method = match &key.method {
        m3u8_rs::KeyMethod::None => KeyMethod::None,
        m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
        m3u8_rs::KeyMethod::SampleAES => KeyMethod::SampleAes,
        m3u8_rs::KeyMethod::Other(name) => KeyMethod::Other(name.clone()),
    };
    let iv = key.iv.as_deref().map(parse_iv).transpose()?;
    Ok(Key {
        method,
        uri: key.uri.clone(),
        iv,
        key_format: key.keyformat.clone(),
        key_format_versions: key.keyformatversions.clone(),
    })
}

/// Parse a hexadecimal IV (`0x` prefix optional), left-padding short values.
pub fn parse_iv(value: &str) -> Result<[u8; 16], PlaylistError> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.len() > 32 {
        return Err(PlaylistError::InvalidIv {
            value: value.to_string(),
            reason: "longer than 128 bits".to_string(),
        });
    }
    let padded = format!("{digits:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv).map_err(|e| PlaylistError::InvalidIv {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    Ok(iv)
}

fn convert_byte_range(
    range: &m3u8_rs::ByteRange,
    uri: &str,
    previous: Option<(&str, u64)>,
) -> ByteRange {
    let offset = range.offset.unwrap_or_else(|| match previous {
        Some((prev_uri, prev_end)) if prev_uri == uri => prev_end,
        _ => 0,
    });
    ByteRange {
        length: range.length,
        offset,
    }
}

fn round_duration(duration: f64) -> f64 {
    (duration * 1_000_000.0).round() / 1_000_000.0
}

/// `#EXT-X-MAP` that the tokenizer left among the playlist-level tags.
fn playlist_level_map(pl: &m3u8_rs::MediaPlaylist) -> Option<Map> {
    let ext = pl.unknown_tags.iter().rev().find(|t| t.tag == "X-MAP")?;
    let attrs = parse_attributes(ext.rest.as_deref()?);
    let mut uri = None;
    let mut byte_range = None;
    for (name, value) in attrs {
        match name.as_str() {
            "URI" => uri = Some(value),
            "BYTERANGE" => {
                let (len, offset) = value.split_once('@').unwrap_or((&value, ""));
                if let Ok(length) = len.trim().parse::<u64>() {
                    byte_range = Some(ByteRange {
                        length,
                        offset: offset.trim().parse().unwrap_or(0),
                    });
                }
            }
            _ => {}
        }
    }
    Some(Map {
        uri: uri?,
        byte_range,
    })
}

fn convert_media(pl: m3u8_rs::MediaPlaylist) -> Result<MediaPlaylist, PlaylistError> {
    let mut segments = Vec::with_capacity(pl.segments.len());
    let mut date_ranges = Vec::new();

    let mut current_key: Option<Arc<Key>> = None;
    let mut current_map: Option<Arc<Map>> = playlist_level_map(&pl).map(Arc::new);
    let mut discontinuity_sequence = pl.discontinuity_sequence;
    let mut previous_range: Option<(String, u64)> = None;
    let mut next_date_time: Option<DateTime<FixedOffset>> = None;

    for (index, seg) in pl.segments.iter().enumerate() {
        let sequence = pl.media_sequence + index as u64;

        if let Some(key) = &seg.key {
            let key = convert_key(key)?;
            current_key = key.is_encrypted().then(|| Arc::new(key));
        }

        if let Some(map) = &seg.map {
            let byte_range = map.byte_range.as_ref().map(|r| ByteRange {
                length: r.length,
                offset: r.offset.unwrap_or(0),
            });
            current_map = Some(Arc::new(Map {
                uri: map.uri.clone(),
                byte_range,
            }));
        }

        if seg.discontinuity {
            discontinuity_sequence += 1;
        }

        let byte_range = seg.byte_range.as_ref().map(|r| {
            convert_byte_range(
                r,
                &seg.uri,
                previous_range.as_ref().map(|(u, end)| (u.as_str(), *end)),
            )
        });
        previous_range = byte_range.map(|r| (seg.uri.clone(), r.end()));

        let duration = round_duration(f64::from(seg.duration));
        let date_time = seg.program_date_time.or(next_date_time);
        next_date_time = date_time.and_then(|dt| {
            let delta = TimeDelta::try_milliseconds((duration * 1000.0) as i64)?;
            dt.checked_add_signed(delta)
        });

        if let Some(dr) = &seg.daterange {
            date_ranges.push(DateRange {
                id: dr.id.clone(),
                class: dr.class.clone(),
                start_date: dr.start_date,
                end_date: dr.end_date,
                duration: dr.duration.map(f64::from),
            });
        }

        if seg.uri.trim().is_empty() {
            warn!(msn = sequence, "Skipping segment with empty URI");
            continue;
        }

        segments.push(Segment {
            sequence,
            uri: seg.uri.clone(),
            duration,
            title: seg.title.clone().filter(|t| !t.is_empty()),
            byte_range,
            discontinuity: seg.discontinuity,
            discontinuity_sequence,
            key: current_key.clone(),
            map: current_map.clone(),
            date_time,
        });
    }

    let playlist_type = match &pl.playlist_type {
        Some(m3u8_rs::MediaPlaylistType::Event) => Some(PlaylistType::Event),
        Some(m3u8_rs::MediaPlaylistType::Vod) => Some(PlaylistType::Vod),
        #[allow(unreachable_patterns)]
        _ => None,
    };

    debug!(
        media_sequence = pl.media_sequence,
        segments = segments.len(),
        end_list = pl.end_list,
        "Parsed media playlist"
    );

    Ok(MediaPlaylist {
        version: pl.version,
        target_duration: pl.target_duration as f64,
        media_sequence: pl.media_sequence,
        discontinuity_sequence: pl.discontinuity_sequence,
        end_list: pl.end_list,
        playlist_type,
        segments,
        date_ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(input: &str) -> MediaPlaylist {
        parse_media_playlist(input.as_bytes()).expect("media playlist should parse")
    }

    #[test]
    fn parses_master_with_variants_and_renditions() {
        let input = "#EXTM3U\n\
            #EXT-X-VERSION:4\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=640x360,AUDIO=\"aac\"\n\
            low.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1600000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\",AUDIO=\"aac\"\n\
            high.m3u8\n";
        let master = parse_master_playlist(input.as_bytes()).unwrap();
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].uri, "low.m3u8");
        assert_eq!(
            master.variants[1].resolution,
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(master.variants[1].audio.as_deref(), Some("aac"));
        let audio: Vec<_> = master.renditions_in(&MediaType::Audio, "aac").collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].language.as_deref(), Some("en"));
        assert!(audio[0].default);
    }

    #[test]
    fn assigns_sequence_numbers() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:100\n\
             #EXTINF:6.0,\na.ts\n#EXTINF:6.0,\nb.ts\n#EXTINF:4.5,\nc.ts\n",
        );
        let seqs: Vec<u64> = pl.segments.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![100, 101, 102]);
        assert!(pl.is_live());
        assert_eq!(pl.target_duration, 6.0);
        assert!((pl.total_duration() - 16.5).abs() < 1e-6);
    }

    #[test]
    fn key_applies_until_replaced_and_none_clears() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"k1\"\n\
             #EXTINF:6,\ns0.ts\n#EXTINF:6,\ns1.ts\n\
             #EXT-X-DISCONTINUITY\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"k2\",IV=0x0000000000000000000000000000000A\n\
             #EXTINF:6,\ns2.ts\n\
             #EXT-X-KEY:METHOD=NONE\n\
             #EXTINF:6,\ns3.ts\n#EXT-X-ENDLIST\n",
        );
        let uris: Vec<Option<&str>> = pl
            .segments
            .iter()
            .map(|s| s.encryption().and_then(|k| k.uri.as_deref()))
            .collect();
        assert_eq!(uris, vec![Some("k1"), Some("k1"), Some("k2"), None]);

        let mut expected_iv = [0u8; 16];
        expected_iv[15] = 0x0a;
        assert_eq!(pl.segments[2].encryption().unwrap().iv, Some(expected_iv));
        assert_eq!(pl.segments[0].encryption().unwrap().iv, None);

        assert!(pl.segments[2].discontinuity);
        assert_eq!(pl.segments[1].discontinuity_sequence, 0);
        assert_eq!(pl.segments[2].discontinuity_sequence, 1);
        assert!(!pl.is_live());
    }

    #[test]
    fn map_is_inherited() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MAP:URI=\"init.mp4\"\n\
             #EXTINF:4,\na.m4s\n#EXTINF:4,\nb.m4s\n",
        );
        assert_eq!(pl.segments.len(), 2);
        for seg in &pl.segments {
            assert_eq!(seg.map.as_ref().map(|m| m.uri.as_str()), Some("init.mp4"));
        }
    }

    #[test]
    fn byte_range_offset_is_inferred() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
             #EXTINF:2,\n#EXT-X-BYTERANGE:100@0\nmedia.ts\n\
             #EXTINF:2,\n#EXT-X-BYTERANGE:50\nmedia.ts\n\
             #EXTINF:2,\n#EXT-X-BYTERANGE:70\nother.ts\n",
        );
        let ranges: Vec<_> = pl.segments.iter().map(|s| s.byte_range).collect();
        assert_eq!(
            ranges,
            vec![
                Some(ByteRange {
                    length: 100,
                    offset: 0
                }),
                Some(ByteRange {
                    length: 50,
                    offset: 100
                }),
                Some(ByteRange {
                    length: 70,
                    offset: 0
                }),
            ]
        );
        assert_eq!(ranges[1].unwrap().to_header_value(), "bytes=100-149");
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-TWITCH-ELAPSED-SECS:12.3\n\
             #EXT-X-SOMETHING-NEW:FOO=BAR\n#EXTINF:2,\na.ts\n",
        );
        assert_eq!(pl.segments.len(), 1);
    }

    #[test]
    fn program_date_time_is_carried_forward() {
        let pl = media(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
             #EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00.000Z\n\
             #EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n",
        );
        let first = pl.segments[0].date_time.unwrap();
        let second = pl.segments[1].date_time.unwrap();
        assert_eq!((second - first).num_milliseconds(), 2000);
    }

    #[test]
    fn segment_name_strips_query() {
        let pl = media("#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2,\nhttps://cdn/x/ad/seg1.ts?tok=1\n");
        assert_eq!(pl.segments[0].name(), "seg1.ts");
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(
            parse_playlist(b"#EXTINF:2,\na.ts\n"),
            Err(PlaylistError::MissingHeader)
        ));
    }

    #[test]
    fn master_is_not_media() {
        let input = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n";
        assert!(matches!(
            parse_media_playlist(input.as_bytes()),
            Err(PlaylistError::UnexpectedMaster)
        ));
    }

    #[test]
    fn parse_iv_pads_short_values() {
        let iv = parse_iv("0x1").unwrap();
        assert_eq!(iv[15], 1);
        assert!(iv[..15].iter().all(|b| *b == 0));
        assert!(parse_iv("0xzz").is_err());
    }

    #[test]
    fn audio_only_detection() {
        let variant = Variant {
            uri: "a.m3u8".into(),
            bandwidth: 128_000,
            average_bandwidth: None,
            codecs: Some("mp4a.40.2".into()),
            resolution: None,
            frame_rate: None,
            audio: None,
            video: None,
            subtitles: None,
            is_i_frame: false,
        };
        assert!(variant.is_audio_only());
        let video = Variant {
            codecs: Some("avc1.4d401f,mp4a.40.2".into()),
            ..variant
        };
        assert!(!video.is_audio_only());
    }
}
