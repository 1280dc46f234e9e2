//! Data-driven plugins read from JSON manifests.
//!
//! A manifest names its matchers and a URL template filled from the named
//! captures of the winning matcher:
//!
//! ```json
//! {
//!   "name": "example",
//!   "priority": 30,
//!   "matchers": [{ "name": "live", "pattern": "https://example\\.tv/(?P<channel>\\w+)$" }],
//!   "kind": "hls",
//!   "url": "https://cdn.example.tv/{channel}/master.m3u8",
//!   "headers": { "Referer": "https://example.tv/" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use mesio::{HttpStream, OptionMap, StreamRef};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::hls::hls_streams;
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};
use crate::registry::{Matcher, NORMAL_PRIORITY, PluginDescriptor};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Hls,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMatcher {
    #[serde(default)]
    pub name: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub matchers: Vec<ManifestMatcher>,
    pub kind: ManifestKind,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_priority() -> i32 {
    NORMAL_PRIORITY
}

impl PluginManifest {
    pub fn from_json(text: &str) -> Result<Self, PluginError> {
        Ok(serde_json::from_str(text)?)
    }

    fn invalid(&self, reason: impl Into<String>) -> PluginError {
        PluginError::InvalidPlugin {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Compile the matchers and check that every placeholder of the URL
    /// and header templates is a named group of some matcher.
    pub fn into_descriptor(self) -> Result<PluginDescriptor, PluginError> {
        if self.matchers.is_empty() {
            return Err(self.invalid("no matchers"));
        }
        let matchers = self
            .matchers
            .iter()
            .map(|m| -> Result<Matcher, PluginError> {
                let mut matcher = Matcher::new(&m.pattern).map_err(|e| self.invalid(e.to_string()))?;
                matcher.name = m.name.clone();
                matcher.priority = m.priority;
                Ok(matcher)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let groups: Vec<&str> = matchers
            .iter()
            .flat_map(|m| m.pattern.capture_names().flatten())
            .collect();
        let templates = std::iter::once(self.url.as_str()).chain(self.headers.values().map(String::as_str));
        for template in templates {
            for caps in PLACEHOLDER_RE.captures_iter(template) {
                if !groups.contains(&&caps[1]) {
                    return Err(self.invalid(format!("unknown placeholder `{{{}}}`", &caps[1])));
                }
            }
        }
        for name in self.headers.keys() {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| self.invalid(format!("invalid header name `{name}`")))?;
        }

        let manifest = Arc::new(self);
        let descriptor = PluginDescriptor::new(manifest.name.clone(), {
            let manifest = manifest.clone();
            move |ctx| {
                Ok(Box::new(ManifestPlugin {
                    ctx,
                    manifest: manifest.clone(),
                }) as Box<dyn Plugin>)
            }
        })
        .with_priority(manifest.priority);
        Ok(matchers.into_iter().fold(descriptor, PluginDescriptor::with_matcher))
    }
}

fn render(template: &str, captures: &BTreeMap<String, String>) -> Result<String, PluginError> {
    let mut missing = None;
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
        match captures.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(PluginError::plugin(format!("URL did not capture `{name}`"))),
        None => Ok(rendered.into_owned()),
    }
}

pub struct ManifestPlugin {
    ctx: PluginContext,
    manifest: Arc<PluginManifest>,
}

#[async_trait]
impl Plugin for ManifestPlugin {
    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    async fn streams(&mut self) -> Result<Vec<(String, StreamRef)>, PluginError> {
        let url = render(&self.manifest.url, &self.ctx.captures)?;
        let mut headers = HeaderMap::new();
        for (name, template) in &self.manifest.headers {
            let value = render(template, &self.ctx.captures)?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PluginError::plugin(format!("invalid header `{name}`: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| PluginError::plugin(format!("invalid header value for `{name}`: {e}")))?;
            headers.insert(name, value);
        }
        debug!(plugin = %self.manifest.name, url = %url, "Resolved manifest URL");

        match self.manifest.kind {
            ManifestKind::Hls => hls_streams(&self.ctx.streams, &url, headers, OptionMap::new()).await,
            ManifestKind::Http => {
                let stream = HttpStream::new(self.ctx.streams.clone(), url).with_headers(headers);
                Ok(vec![("live".to_string(), Arc::new(stream) as StreamRef)])
            }
        }
    }
}

/// Read every `*.json` manifest in `dir`, in file name order.
///
/// A manifest that cannot be read or compiled is logged and skipped.
pub async fn load_plugins(dir: &Path) -> Result<Vec<PluginDescriptor>, PluginError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut descriptors = Vec::with_capacity(paths.len());
    for path in paths {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(text) => PluginManifest::from_json(&text).and_then(PluginManifest::into_descriptor),
            Err(e) => Err(e.into()),
        };
        match loaded {
            Ok(descriptor) => {
                debug!(path = %path.display(), plugin = %descriptor.name, "Loaded plugin manifest");
                descriptors.push(descriptor);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest"),
        }
    }
    info!(dir = %dir.display(), count = descriptors.len(), "Loaded plugin manifests");
    Ok(descriptors)
}
