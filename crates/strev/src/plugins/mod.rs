//! Built-in protocol plugins and data-driven manifest plugins.

pub mod file;
pub mod hls;
pub mod http;
pub mod manifest;

use mesio::{OptionMap, OptionValue};

use crate::error::PluginError;
use crate::registry::PluginDescriptor;

pub use manifest::{PluginManifest, load_plugins};

/// Descriptors of the protocol plugins every session starts with.
pub fn builtin() -> Vec<PluginDescriptor> {
    vec![
        hls::descriptor(),
        hls::m3u8_descriptor(),
        http::descriptor(),
        file::descriptor(),
    ]
}

/// Prefix `https://` when `url` carries no scheme.
pub fn with_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            url.to_string()
        }
        _ => format!("https://{}", url.trim_start_matches("//")),
    }
}

/// Parse whitespace-separated `key=value` parameters.
///
/// Values are typed: integers, floats, `true`/`false`, and quoted or bare
/// strings. Keys use dashes, so `live_edge` and `live-edge` are the same.
pub fn parse_params(input: &str) -> Result<OptionMap, PluginError> {
    let mut params = OptionMap::new();
    for token in split_tokens(input)? {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| PluginError::plugin(format!("invalid parameter `{token}`, expected key=value")))?;
        let key = key.trim().replace('_', "-");
        if key.is_empty() {
            return Err(PluginError::plugin(format!("invalid parameter `{token}`")));
        }
        params.insert(key, literal(value));
    }
    Ok(params)
}

fn split_tokens(input: &str) -> Result<Vec<String>, PluginError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in input.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(PluginError::plugin(format!("unterminated quote in `{input}`")));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn literal(raw: &str) -> OptionValue {
    let raw = raw.trim();
    for q in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return OptionValue::String(raw[1..raw.len() - 1].to_string());
        }
    }
    match raw {
        "true" | "True" => OptionValue::Bool(true),
        "false" | "False" => OptionValue::Bool(false),
        "null" | "None" => OptionValue::Null,
        _ => raw
            .parse::<i64>()
            .map(OptionValue::Int)
            .or_else(|_| raw.parse::<f64>().map(OptionValue::Float))
            .unwrap_or_else(|_| OptionValue::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com/live.m3u8", "https://example.com/live.m3u8")]
    #[case("//example.com/a", "https://example.com/a")]
    #[case("http://example.com/a", "http://example.com/a")]
    #[case("hls://example.com/a", "hls://example.com/a")]
    #[case("example.com/?next=https://x", "https://example.com/?next=https://x")]
    fn scheme_is_added(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(with_scheme(input), expected);
    }

    #[test]
    fn params_are_typed() {
        let params =
            parse_params(r#"hls_live_edge=1 hls-start-offset=2.5 hls-live-restart=true name="a b" method=POST"#)
                .unwrap();
        assert_eq!(params["hls-live-edge"], OptionValue::Int(1));
        assert_eq!(params["hls-start-offset"], OptionValue::Float(2.5));
        assert_eq!(params["hls-live-restart"], OptionValue::Bool(true));
        assert_eq!(params["name"], OptionValue::String("a b".into()));
        assert_eq!(params["method"], OptionValue::String("POST".into()));

        assert!(parse_params("novalue").is_err());
        assert!(parse_params("a='open").is_err());
        assert!(parse_params("").unwrap().is_empty());
    }
}
