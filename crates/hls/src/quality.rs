//! Quality names and their ordering.
//!
//! Variants are labelled `<height>p` (with the frame rate appended above
//! 30fps), or `<kbps>k` when no resolution is advertised. The weight of a
//! label drives the `best`/`worst` aliases and the sorting filters.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::playlist::Variant;

const ALT_WEIGHT_MOD: f64 = 0.01;
const BIT_RATE_WEIGHT_RATIO: f64 = 2.8;

/// Named qualities that do not follow the `720p`/`3000k` patterns.
const EXTRA_WEIGHTS: &[(&str, &[(&str, f64)])] = &[
    ("other", &[("live", 1080.0)]),
    ("tv", &[("hd", 1080.0), ("sd", 576.0)]),
    ("quality", &[("ehq", 720.0), ("hq", 576.0), ("sq", 360.0)]),
];

static WEIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(k|p)?(\d+)?(\+)?(?:[a_](\d+)k)?(?:_(alt)(\d)?)?$").unwrap()
});

static FILTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<op><=|>=|<|>)?(?P<value>[\w+]+)$").unwrap());

/// Weight and weight group of a quality name.
///
/// Names in different groups are not comparable; unknown names weigh 0 in
/// the `none` group.
pub fn stream_weight(name: &str) -> (f64, &'static str) {
    for (group, weights) in EXTRA_WEIGHTS {
        if let Some((_, weight)) = weights.iter().find(|(n, _)| *n == name) {
            return (*weight, *group);
        }
    }

    let Some(caps) = WEIGHT_RE.captures(name) else {
        return (0.0, "none");
    };

    let number = |idx: usize| -> f64 {
        caps.get(idx)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let mut weight = 0.0;
    if caps.get(6).is_some() {
        weight -= match caps.get(7) {
            Some(_) => ALT_WEIGHT_MOD * number(7),
            None => ALT_WEIGHT_MOD,
        };
    }

    match caps.get(2).map(|m| m.as_str()) {
        Some("k") => (weight + number(1), "bitrate"),
        Some("p") => {
            weight += number(1);
            weight += number(3);
            if caps.get(4).is_some() {
                weight += 1.0;
            }
            weight += number(5) / BIT_RATE_WEIGHT_RATIO;
            (weight, "pixels")
        }
        _ => (0.0, "none"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream filter expression `{expr}`")]
pub struct QualityFilterError {
    pub expr: String,
}

/// A `sorting_excludes` expression such as `>720p`, `<=480p` or `hq`.
///
/// A name is excluded when it sits in the same weight group as the
/// expression's value and the comparison holds.
#[derive(Debug, Clone, PartialEq)]
pub struct SortingFilter {
    op: FilterOp,
    weight: f64,
    group: &'static str,
}

impl SortingFilter {
    pub fn parse(expr: &str) -> Result<Self, QualityFilterError> {
        let caps = FILTER_RE
            .captures(expr.trim())
            .ok_or_else(|| QualityFilterError {
                expr: expr.to_string(),
            })?;
        let op = match caps.name("op").map(|m| m.as_str()) {
            Some("<") => FilterOp::Lt,
            Some("<=") => FilterOp::Le,
            Some(">") => FilterOp::Gt,
            Some(">=") => FilterOp::Ge,
            _ => FilterOp::Eq,
        };
        let value = caps.name("value").map(|m| m.as_str()).unwrap_or_default();
        let (weight, group) = stream_weight(value);
        Ok(Self { op, weight, group })
    }

    /// Whether `name` survives this filter.
    pub fn keep(&self, name: &str) -> bool {
        let (weight, group) = stream_weight(name);
        if group != self.group {
            return true;
        }
        let excluded = match self.op {
            FilterOp::Lt => weight < self.weight,
            FilterOp::Le => weight <= self.weight,
            FilterOp::Gt => weight > self.weight,
            FilterOp::Ge => weight >= self.weight,
            FilterOp::Eq => weight == self.weight,
        };
        !excluded
    }
}

fn base_name(variant: &Variant) -> Option<String> {
    if let Some(res) = variant.resolution.filter(|r| r.height > 0) {
        return Some(match variant.frame_rate {
            Some(fps) if fps > 30.0 => format!("{}p{}", res.height, fps.round() as u64),
            _ => format!("{}p", res.height),
        });
    }
    if variant.is_audio_only() {
        return Some("audio_only".to_string());
    }
    (variant.bandwidth > 0).then(|| format!("{}k", variant.bandwidth / 1000))
}

/// Assign a unique quality name to every playable variant, in input order.
///
/// I-frame variants and variants without any usable attribute are skipped.
/// A repeated name gets the variant's bitrate appended (`720p_3000k`), then
/// `_alt`, `_alt2`, ... when the bitrate does not disambiguate either.
pub fn name_variants<'a, I>(variants: I) -> Vec<(String, &'a Variant)>
where
    I: IntoIterator<Item = &'a Variant>,
{
    let mut taken = HashSet::new();
    let mut named = Vec::new();

    for variant in variants {
        if variant.is_i_frame {
            continue;
        }
        let Some(base) = base_name(variant) else {
            continue;
        };

        let mut name = base.clone();
        if taken.contains(&name) && variant.bandwidth > 0 && base != "audio_only" {
            name = format!("{base}_{}k", variant.bandwidth / 1000);
        }
        if taken.contains(&name) {
            let stem = name.clone();
            name = format!("{stem}_alt");
            let mut n = 2;
            while taken.contains(&name) {
                name = format!("{stem}_alt{n}");
                n += 1;
            }
        }

        taken.insert(name.clone());
        named.push((name, variant));
    }

    named
}
