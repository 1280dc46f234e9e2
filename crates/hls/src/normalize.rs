//! Dialect clean-up applied before handing playlist text to the tokenizer.
//!
//! Broadcasters ship playlists with byte-order marks, CRLF line endings,
//! stray blank lines and attribute lists written as `KEY:VALUE` instead of
//! `KEY=VALUE`. The tokenizer is strict about all of these, so every
//! playlist goes through [`normalize`] first.

/// Tags whose payload is an attribute list.
const ATTRIBUTE_LIST_TAGS: &[&str] = &[
    "#EXT-X-KEY:",
    "#EXT-X-SESSION-KEY:",
    "#EXT-X-MAP:",
    "#EXT-X-STREAM-INF:",
    "#EXT-X-I-FRAME-STREAM-INF:",
    "#EXT-X-MEDIA:",
    "#EXT-X-DATERANGE:",
    "#EXT-X-SESSION-DATA:",
    "#EXT-X-START:",
];

/// Normalise playlist text into the canonical form the tokenizer expects.
///
/// Lines are trimmed, blank lines dropped, and the output always ends with a
/// newline so that a trailing URI line is terminated.
pub fn normalize(input: &str) -> String {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut out = String::with_capacity(input.len() + 1);

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ATTRIBUTE_LIST_TAGS.iter().find(|tag| line.starts_with(**tag)) {
            Some(tag) => {
                out.push_str(tag);
                let rest = &line[tag.len()..];
                let parts: Vec<String> = split_attributes(rest)
                    .into_iter()
                    .map(fix_attribute_separator)
                    .collect();
                out.push_str(&parts.join(","));
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    out
}

/// Split an attribute list on commas, keeping quoted values intact.
pub fn split_attributes(rest: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Parse an attribute list into `(NAME, value)` pairs with quotes removed.
pub fn parse_attributes(rest: &str) -> Vec<(String, String)> {
    split_attributes(rest)
        .into_iter()
        .filter_map(|part| {
            let part = fix_attribute_separator(part);
            let (key, value) = part.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim().to_ascii_uppercase(), value.to_string()))
        })
        .collect()
}

/// Rewrite `NAME:value` into `NAME=value` when the attribute has no `=`
/// before its first quote.
fn fix_attribute_separator(part: &str) -> String {
    let unquoted_head = match part.find('"') {
        Some(idx) => &part[..idx],
        None => part,
    };
    if unquoted_head.contains('=') {
        return part.to_string();
    }

    match unquoted_head.split_once(':') {
        Some((name, _))
            if !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-') =>
        {
            format!("{}={}", name, &part[name.len() + 1..])
        }
        _ => part.to_string(),
    }
}
