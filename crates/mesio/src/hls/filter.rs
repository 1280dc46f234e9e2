// Segment filters: decide which segments are skipped (ads, blocked names).
//
// A filtered segment is not fetched and pauses the reader until the next
// written segment, so consumers block through an ad break instead of
// seeing end of stream.

use std::fmt::Debug;
use std::ops::RangeInclusive;

use regex::Regex;
use tracing::debug;

use super::worker::SegmentJob;

pub trait SegmentFilter: Send + Sync + Debug {
    fn should_filter(&self, job: &SegmentJob) -> bool;
}

/// Default filter: segment file names listed in `hls-segment-ignore-names`.
///
/// A name `ad` filters any URI containing `ad.ts`, case-insensitively.
#[derive(Debug, Clone)]
pub struct IgnoreNamesFilter {
    pattern: Option<Regex>,
}

impl IgnoreNamesFilter {
    pub fn new(names: &[String]) -> Self {
        let names: Vec<String> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(regex::escape)
            .collect();
        let pattern = if names.is_empty() {
            None
        } else {
            Regex::new(&format!(r"(?i)(?:{})\.ts", names.join("|"))).ok()
        };
        Self { pattern }
    }

    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }
}

impl SegmentFilter for IgnoreNamesFilter {
    fn should_filter(&self, job: &SegmentJob) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|p| p.is_match(&job.segment.uri))
    }
}

/// Regex over the segment URI, e.g. `/ad/`.
#[derive(Debug, Clone)]
pub struct UriPatternFilter {
    pattern: Regex,
}

impl UriPatternFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl SegmentFilter for UriPatternFilter {
    fn should_filter(&self, job: &SegmentJob) -> bool {
        self.pattern.is_match(&job.segment.uri)
    }
}

/// Segments whose program date time falls inside an ad `EXT-X-DATERANGE`.
#[derive(Debug, Clone)]
pub struct DateRangeAdFilter {
    classes: Vec<String>,
    id_prefixes: Vec<String>,
}

impl Default for DateRangeAdFilter {
    fn default() -> Self {
        Self {
            classes: vec!["twitch-stitched-ad".to_string()],
            id_prefixes: vec!["stitched-ad-".to_string()],
        }
    }
}

impl DateRangeAdFilter {
    pub fn new(classes: Vec<String>, id_prefixes: Vec<String>) -> Self {
        Self {
            classes,
            id_prefixes,
        }
    }
}

impl SegmentFilter for DateRangeAdFilter {
    fn should_filter(&self, job: &SegmentJob) -> bool {
        let Some(time) = job.segment.date_time else {
            return false;
        };
        job.date_ranges
            .iter()
            .filter(|dr| {
                dr.class
                    .as_deref()
                    .is_some_and(|c| self.classes.iter().any(|x| x == c))
                    || self.id_prefixes.iter().any(|p| dr.id.starts_with(p.as_str()))
            })
            .any(|dr| {
                let hit = dr.contains(time);
                if hit {
                    debug!(msn = job.segment.sequence, id = %dr.id, "Segment inside ad date range");
                }
                hit
            })
    }
}

/// Explicit media-sequence blocks.
#[derive(Debug, Clone)]
pub struct SequenceRangeFilter {
    ranges: Vec<RangeInclusive<u64>>,
}

impl SequenceRangeFilter {
    pub fn new(ranges: Vec<RangeInclusive<u64>>) -> Self {
        Self { ranges }
    }
}

impl SegmentFilter for SequenceRangeFilter {
    fn should_filter(&self, job: &SegmentJob) -> bool {
        self.ranges
            .iter()
            .any(|r| r.contains(&job.segment.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use hls::{DateRange, Segment};
    use std::sync::Arc;
    use url::Url;

    fn job(sequence: u64, uri: &str, date_time: Option<&str>, ranges: Vec<DateRange>) -> SegmentJob {
        SegmentJob {
            segment: Segment {
                sequence,
                uri: uri.to_string(),
                duration: 2.0,
                title: None,
                byte_range: None,
                discontinuity: false,
                discontinuity_sequence: 0,
                key: None,
                map: None,
                date_time: date_time.map(|t| DateTime::parse_from_rfc3339(t).unwrap()),
            },
            base: Arc::new(Url::parse("https://cdn.example.com/live/index.m3u8").unwrap()),
            date_ranges: ranges.into(),
        }
    }

    #[test]
    fn ignore_names() {
        let filter = IgnoreNamesFilter::new(&["preroll".to_string(), "AD".to_string()]);
        assert!(filter.is_active());
        assert!(filter.should_filter(&job(1, "segments/preroll.ts", None, vec![])));
        assert!(filter.should_filter(&job(1, "https://x/ad.ts?x=1", None, vec![])));
        assert!(!filter.should_filter(&job(1, "segment_12.ts", None, vec![])));
        assert!(!IgnoreNamesFilter::new(&[]).is_active());
    }

    #[test]
    fn uri_pattern() {
        let filter = UriPatternFilter::new("/ad/").unwrap();
        assert!(filter.should_filter(&job(1, "https://cdn/ad/1.ts", None, vec![])));
        assert!(!filter.should_filter(&job(1, "https://cdn/live/1.ts", None, vec![])));
    }

    #[test]
    fn date_range_ads() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:10+00:00").unwrap();
        let ad = DateRange {
            id: "stitched-ad-1".into(),
            class: None,
            start_date: start,
            end_date: None,
            duration: Some(30.0),
        };
        let other = DateRange {
            id: "chapter".into(),
            class: Some("com.example.chapter".into()),
            start_date: DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
            end_date: None,
            duration: Some(3600.0),
        };
        let filter = DateRangeAdFilter::default();
        let ranges = vec![ad, other];
        assert!(filter.should_filter(&job(1, "a.ts", Some("2024-01-01T00:00:20+00:00"), ranges.clone())));
        assert!(!filter.should_filter(&job(1, "a.ts", Some("2024-01-01T00:00:50+00:00"), ranges.clone())));
        assert!(!filter.should_filter(&job(1, "a.ts", None, ranges)));
    }

    #[test]
    fn sequence_blocks() {
        let filter = SequenceRangeFilter::new(vec![10..=12, 20..=20]);
        assert!(filter.should_filter(&job(11, "a.ts", None, vec![])));
        assert!(filter.should_filter(&job(20, "a.ts", None, vec![])));
        assert!(!filter.should_filter(&job(13, "a.ts", None, vec![])));
    }
}
