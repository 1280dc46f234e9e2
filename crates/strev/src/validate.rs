//! Typed response validation.
//!
//! A [`Schema`] checks a [`serde_json::Value`] and produces a typed result,
//! reporting failures with the path of the offending value. Bodies in other
//! formats are first turned into values by a [`BodyParser`]: JSON, named
//! regex captures, the first matching XML element, or an HTML `<meta>` tag.
//!
//! ```rust,ignore
//! let schema = field("data", field("stream_url", url()));
//! let stream_url = ResponseSchema::json(schema).parse(&body)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted location of the failing value, empty at the root.
    pub path: String,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "at `{}`: {}", self.path, self.reason)
        }
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            reason: reason.into(),
        }
    }

    /// Prefix the path with `segment`.
    fn within(mut self, segment: &str) -> Self {
        self.path = if self.path.is_empty() {
            segment.to_string()
        } else if self.path.starts_with('[') {
            format!("{segment}{}", self.path)
        } else {
            format!("{segment}.{}", self.path)
        };
        self
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn expected(what: &str, value: &Value) -> ValidationError {
    ValidationError::new(format!("expected {what}, got {}", kind(value)))
}

type CheckFn<T> = dyn Fn(&Value) -> Result<T, ValidationError> + Send + Sync;

/// A composable check from a JSON value to `T`.
pub struct Schema<T> {
    check: Arc<CheckFn<T>>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            check: self.check.clone(),
        }
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Schema")
    }
}

impl<T: 'static> Schema<T> {
    pub fn new(check: impl Fn(&Value) -> Result<T, ValidationError> + Send + Sync + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }

    pub fn validate(&self, value: &Value) -> Result<T, ValidationError> {
        (self.check)(value)
    }

    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Schema<U> {
        Schema::new(move |value| self.validate(value).map(&f))
    }

    /// Transform the result with a fallible function.
    pub fn and_then<U: 'static>(
        self,
        f: impl Fn(T) -> Result<U, String> + Send + Sync + 'static,
    ) -> Schema<U> {
        Schema::new(move |value| self.validate(value).and_then(|v| f(v).map_err(ValidationError::new)))
    }

    /// Keep results for which `predicate` holds.
    pub fn filter(
        self,
        reason: &'static str,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Schema<T> {
        Schema::new(move |value| {
            let result = self.validate(value)?;
            if predicate(&result) {
                Ok(result)
            } else {
                Err(ValidationError::new(reason))
            }
        })
    }

    /// `null` becomes `None`; anything else must pass.
    pub fn optional(self) -> Schema<Option<T>> {
        Schema::new(move |value| match value {
            Value::Null => Ok(None),
            other => self.validate(other).map(Some),
        })
    }

    /// Try `other` when this schema fails. The first error is reported.
    pub fn or(self, other: Schema<T>) -> Schema<T> {
        Schema::new(move |value| self.validate(value).or_else(|e| other.validate(value).map_err(|_| e)))
    }
}

pub fn any() -> Schema<Value> {
    Schema::new(|value| Ok(value.clone()))
}

pub fn string() -> Schema<String> {
    Schema::new(|value| {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| expected("string", value))
    })
}

pub fn int() -> Schema<i64> {
    Schema::new(|value| match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| expected("integer", value)),
        Value::String(s) => s.trim().parse().map_err(|_| expected("integer", value)),
        _ => Err(expected("integer", value)),
    })
}

pub fn float() -> Schema<f64> {
    Schema::new(|value| match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| expected("number", value)),
        Value::String(s) => s.trim().parse().map_err(|_| expected("number", value)),
        _ => Err(expected("number", value)),
    })
}

pub fn boolean() -> Schema<bool> {
    Schema::new(|value| match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(expected("bool", value)),
    })
}

/// An absolute http(s) URL.
pub fn url() -> Schema<Url> {
    Schema::new(|value| {
        let raw = value.as_str().ok_or_else(|| expected("URL string", value))?;
        let parsed = Url::parse(raw).map_err(|e| ValidationError::new(format!("invalid URL `{raw}`: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(ValidationError::new(format!("unexpected URL scheme `{scheme}`"))),
        }
    })
}

/// A string equal to one of `allowed`.
pub fn one_of(allowed: &[&str]) -> Schema<String> {
    let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    string().and_then(move |s| {
        if allowed.contains(&s) {
            Ok(s)
        } else {
            Err(format!("`{s}` is not one of {allowed:?}"))
        }
    })
}

/// Object member `key`, which must exist.
pub fn field<T: 'static>(key: &str, inner: Schema<T>) -> Schema<T> {
    let key = key.to_string();
    Schema::new(move |value| {
        let object = value.as_object().ok_or_else(|| expected("object", value))?;
        let member = object
            .get(&key)
            .ok_or_else(|| ValidationError::new("missing key").within(&key))?;
        inner.validate(member).map_err(|e| e.within(&key))
    })
}

/// Nested member by dotted path, e.g. `data.room.status`.
pub fn path<T: 'static>(dotted: &str, inner: Schema<T>) -> Schema<T> {
    dotted
        .rsplit('.')
        .filter(|k| !k.is_empty())
        .fold(inner, |schema, key| field(key, schema))
}

/// Every element of a list.
pub fn list<T: 'static>(item: Schema<T>) -> Schema<Vec<T>> {
    Schema::new(move |value| {
        let items = value.as_array().ok_or_else(|| expected("list", value))?;
        items
            .iter()
            .enumerate()
            .map(|(i, v)| item.validate(v).map_err(|e| e.within(&format!("[{i}]"))))
            .collect()
    })
}

/// Deserialize the value into `T`.
pub fn deserialize<T: DeserializeOwned + 'static>() -> Schema<T> {
    Schema::new(|value| T::deserialize(value).map_err(|e| ValidationError::new(e.to_string())))
}

/// How a response body becomes a [`Value`].
#[derive(Debug, Clone)]
pub enum BodyParser {
    Json,
    /// Named groups of the first match, as a string object.
    Regex(Regex),
    /// The first element at a `/`-separated tag path.
    XmlFind(String),
    /// `content` of `<meta property=.. >` or `<meta name=.. >`.
    HtmlMeta(String),
    /// The body as a JSON string.
    Text,
}

impl BodyParser {
    pub fn parse(&self, body: &str) -> Result<Value, ValidationError> {
        match self {
            BodyParser::Json => parse_json(body),
            BodyParser::Regex(re) => regex_captures(re, body),
            BodyParser::XmlFind(path) => xml_find(body, path),
            BodyParser::HtmlMeta(property) => html_meta(body, property).map(Value::String),
            BodyParser::Text => Ok(Value::String(body.to_string())),
        }
    }
}

/// A body parser followed by a schema.
#[derive(Debug, Clone)]
pub struct ResponseSchema<T> {
    parser: BodyParser,
    schema: Schema<T>,
}

impl<T: 'static> ResponseSchema<T> {
    pub fn new(parser: BodyParser, schema: Schema<T>) -> Self {
        Self { parser, schema }
    }

    pub fn json(schema: Schema<T>) -> Self {
        Self::new(BodyParser::Json, schema)
    }

    pub fn regex(re: Regex, schema: Schema<T>) -> Self {
        Self::new(BodyParser::Regex(re), schema)
    }

    pub fn xml(path: impl Into<String>, schema: Schema<T>) -> Self {
        Self::new(BodyParser::XmlFind(path.into()), schema)
    }

    pub fn parse(&self, body: &str) -> Result<T, ValidationError> {
        let value = self.parser.parse(body)?;
        self.schema.validate(&value)
    }
}

pub fn parse_json(body: &str) -> Result<Value, ValidationError> {
    serde_json::from_str(body).map_err(|e| ValidationError::new(format!("invalid JSON: {e}")))
}

pub fn regex_captures(re: &Regex, body: &str) -> Result<Value, ValidationError> {
    let caps = re
        .captures(body)
        .ok_or_else(|| ValidationError::new(format!("pattern `{}` did not match", re.as_str())))?;
    let mut object = Map::new();
    for name in re.capture_names().flatten() {
        let value = caps
            .name(name)
            .map_or(Value::Null, |m| Value::String(m.as_str().to_string()));
        object.insert(name.to_string(), value);
    }
    Ok(Value::Object(object))
}

fn element_value(start: &BytesStart<'_>) -> Result<Map<String, Value>, ValidationError> {
    let mut attrs = Map::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ValidationError::new(format!("invalid XML attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ValidationError::new(format!("invalid XML attribute: {e}")))?;
        attrs.insert(key, Value::String(value.into_owned()));
    }
    let mut object = Map::new();
    object.insert("attrs".into(), Value::Object(attrs));
    object.insert("text".into(), Value::String(String::new()));
    Ok(object)
}

/// First element at `path` (e.g. `MPD/Period/AdaptationSet`) as
/// `{"attrs": {..}, "text": ".."}`.
pub fn xml_find(body: &str, path: &str) -> Result<Value, ValidationError> {
    let wanted: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if wanted.is_empty() {
        return Err(ValidationError::new("empty XML path"));
    }

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut found: Option<(usize, Map<String, Value>)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ValidationError::new(format!("invalid XML: {e}")))?;
        match event {
            Event::Start(start) => {
                stack.push(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                if found.is_none() && stack == wanted {
                    found = Some((stack.len(), element_value(&start)?));
                }
            }
            Event::Empty(start) => {
                stack.push(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                if found.is_none() && stack == wanted {
                    return Ok(Value::Object(element_value(&start)?));
                }
                stack.pop();
            }
            Event::Text(text) => {
                if let Some((depth, object)) = &mut found
                    && *depth == stack.len()
                {
                    let text = text
                        .unescape()
                        .map_err(|e| ValidationError::new(format!("invalid XML text: {e}")))?;
                    object.insert("text".into(), Value::String(text.into_owned()));
                }
            }
            Event::CData(data) => {
                if let Some((depth, object)) = &mut found
                    && *depth == stack.len()
                {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    object.insert("text".into(), Value::String(text));
                }
            }
            Event::End(_) => {
                if found.as_ref().is_some_and(|(depth, _)| *depth == stack.len()) {
                    let (_, object) = found.take().unwrap_or_default();
                    return Ok(Value::Object(object));
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(ValidationError::new(format!("no XML element at `{path}`")))
}

static META_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?is)<meta\s+([^>]*?)/?>"#).unwrap());
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)([\w:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

fn attributes(tag: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_ascii_lowercase(), value.to_string())
        })
        .collect()
}

/// `content` of the first `<meta>` whose `property` or `name` is `key`.
pub fn html_meta(body: &str, key: &str) -> Result<String, ValidationError> {
    META_RE
        .captures_iter(body)
        .map(|c| attributes(&c[1]))
        .find(|attrs| {
            attrs.get("property").map(String::as_str) == Some(key)
                || attrs.get("name").map(String::as_str) == Some(key)
        })
        .and_then(|mut attrs| attrs.remove("content"))
        .ok_or_else(|| ValidationError::new(format!("no <meta> tag `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_fields_report_paths() {
        let schema = path("data.streams", list(field("url", url())));
        let ok = json!({"data": {"streams": [{"url": "https://a/1.m3u8"}]}});
        assert_eq!(schema.validate(&ok).unwrap()[0].as_str(), "https://a/1.m3u8");

        let bad = json!({"data": {"streams": [{"url": "https://a"}, {"url": 5}]}});
        let err = schema.validate(&bad).unwrap_err();
        assert_eq!(err.path, "data.streams[1].url");
        assert_eq!(err.reason, "expected URL string, got number");

        let missing = json!({"data": {}});
        assert_eq!(schema.validate(&missing).unwrap_err().path, "data.streams");
    }

    #[test]
    fn combinators() {
        assert_eq!(int().validate(&json!("42")).unwrap(), 42);
        assert!(int().validate(&json!(1.5)).is_err());
        assert_eq!(string().optional().validate(&Value::Null).unwrap(), None);
        assert_eq!(boolean().validate(&json!("TRUE")).unwrap(), true);
        assert!(one_of(&["live", "vod"]).validate(&json!("replay")).is_err());

        let status = int().or(string().map(|_| -1));
        assert_eq!(status.validate(&json!("offline")).unwrap(), -1);

        let positive = int().filter("must be positive", |n| *n > 0);
        assert_eq!(positive.validate(&json!(-3)).unwrap_err().reason, "must be positive");

        assert!(url().validate(&json!("ftp://host/file")).is_err());
    }

    #[test]
    fn deserializes_structs() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Room {
            id: u64,
            live: bool,
        }
        let room = field("room", deserialize::<Room>())
            .validate(&json!({"room": {"id": 7, "live": true}}))
            .unwrap();
        assert_eq!(room, Room { id: 7, live: true });
    }

    #[test]
    fn regex_bodies() {
        let schema = ResponseSchema::regex(
            Regex::new(r#"hlsUrl":"(?P<url>[^"]+)""#).unwrap(),
            field("url", url()),
        );
        let parsed = schema.parse(r#"var cfg = {"hlsUrl":"https://cdn/x.m3u8"};"#).unwrap();
        assert_eq!(parsed.as_str(), "https://cdn/x.m3u8");
        assert!(schema.parse("nothing here").is_err());
    }

    #[test]
    fn xml_elements() {
        let body = r#"<?xml version="1.0"?>
            <MPD type="dynamic"><Period id="p0"><BaseURL>https://cdn/a/</BaseURL>
            <AdaptationSet mimeType="video/mp4"/></Period></MPD>"#;
        let schema = ResponseSchema::xml("MPD/Period/BaseURL", field("text", url()));
        assert_eq!(schema.parse(body).unwrap().as_str(), "https://cdn/a/");

        let set = xml_find(body, "MPD/Period/AdaptationSet").unwrap();
        assert_eq!(set["attrs"]["mimeType"], "video/mp4");
        assert!(xml_find(body, "MPD/Missing").is_err());
    }

    #[test]
    fn html_meta_tags() {
        let body = r#"<html><head>
            <meta charset="utf-8">
            <meta property="og:title" content="Late night stream" />
            <meta name='description' content='Talk &amp; music'>
            </head></html>"#;
        assert_eq!(html_meta(body, "og:title").unwrap(), "Late night stream");
        assert_eq!(html_meta(body, "description").unwrap(), "Talk &amp; music");
        assert!(html_meta(body, "og:image").is_err());
    }
}
