//! The session facade: owns the HTTP client, the options and the plugin
//! registry, and turns URLs into named streams.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use hls::{SortingFilter, stream_weight};
use mesio::{
    Cookie, HttpConfig, HttpSession, Muxer, OptionValue, Options, ProxyConfig, RequestOptions,
    SharedOptions, StreamContext, StreamDescriptor, StreamError, StreamRef,
};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::plugin::{Metadata, Plugin, PluginContext};
use crate::plugins::{self, with_scheme};
use crate::registry::{PluginDescriptor, PluginMatch, PluginRegistry};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_+]+").unwrap());

/// A URL and the plugin that handles it.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    pub name: String,
    pub plugin: PluginMatch,
    /// The URL after scheme completion and redirects.
    pub url: String,
}

/// Parameters of [`Session::streams`].
#[derive(Debug, Clone, Default)]
pub struct StreamsOptions {
    /// Expressions such as `>720p` removing names from the `best`/`worst` candidates.
    pub sorting_excludes: Vec<String>,
    /// Accepted stream shortnames, in order of preference. Falls back to the
    /// `stream-types` option; `None` accepts every type.
    pub stream_types: Option<Vec<String>>,
}

/// Named streams ordered by quality, lowest first, followed by the
/// `worst`/`best` aliases.
#[derive(Debug, Clone, Default)]
pub struct StreamMap {
    entries: Vec<(String, StreamRef)>,
}

impl StreamMap {
    pub fn get(&self, name: &str) -> Option<&StreamRef> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StreamRef)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the stream an alias such as `best` points at.
    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        let target = self.get(alias)?;
        self.entries
            .iter()
            .find(|(n, s)| !is_alias(n) && Arc::ptr_eq(s, target))
            .map(|(n, _)| n.as_str())
    }
}

impl IntoIterator for StreamMap {
    type Item = (String, StreamRef);
    type IntoIter = std::vec::IntoIter<(String, StreamRef)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

fn is_alias(name: &str) -> bool {
    matches!(name, "best" | "worst" | "best-unfiltered" | "worst-unfiltered")
}

pub struct Session {
    http: HttpSession,
    options: SharedOptions,
    registry: RwLock<PluginRegistry>,
    streams: StreamContext,
}

impl Session {
    /// A session with the default HTTP configuration and the built-in plugins.
    pub fn new() -> Result<Self, PluginError> {
        Self::with_config(HttpConfig::default())
    }

    pub fn with_config(config: HttpConfig) -> Result<Self, PluginError> {
        let http = HttpSession::new(config)?;
        let options = Options::session().shared();
        let streams = StreamContext::new(http.clone(), options.clone());
        let mut registry = PluginRegistry::new();
        for descriptor in plugins::builtin() {
            registry.register(descriptor);
        }
        Ok(Self {
            http,
            options,
            registry: RwLock::new(registry),
            streams,
        })
    }

    pub fn http(&self) -> &HttpSession {
        &self.http
    }

    pub fn options(&self) -> &SharedOptions {
        &self.options
    }

    pub fn stream_context(&self) -> &StreamContext {
        &self.streams
    }

    /// Set a session option. `http-*` keys also reconfigure the HTTP client.
    pub fn set_option(&self, key: &str, value: impl Into<OptionValue>) -> Result<(), PluginError> {
        let value = value.into();
        if key.starts_with("http-") {
            self.apply_http_option(key, &value)?;
        }
        self.options.write().set(key, value);
        Ok(())
    }

    pub fn get_option(&self, key: &str) -> Option<OptionValue> {
        self.options.read().get(key).cloned()
    }

    /// Set an option in the namespace of `plugin`.
    pub fn set_plugin_option(&self, plugin: &str, key: &str, value: impl Into<OptionValue>) {
        self.options.write().set(format!("plugin.{plugin}.{key}"), value);
    }

    fn apply_http_option(&self, key: &str, value: &OptionValue) -> Result<(), PluginError> {
        let invalid = |reason: &str| {
            PluginError::from(StreamError::InvalidOption {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };
        match key {
            "http-headers" => {
                let pairs = value.as_string_pairs().ok_or_else(|| invalid("expected a map"))?;
                let mut headers = HeaderMap::with_capacity(pairs.len());
                for (name, value) in pairs {
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(|e| invalid(&e.to_string()))?;
                    let value = HeaderValue::from_str(&value).map_err(|e| invalid(&e.to_string()))?;
                    headers.insert(name, value);
                }
                self.http.set_headers(headers)?;
            }
            "http-query-params" => {
                let pairs = value.as_string_pairs().ok_or_else(|| invalid("expected a map"))?;
                self.http.set_params(pairs)?;
            }
            "http-cookies" => {
                let pairs = value.as_string_pairs().ok_or_else(|| invalid("expected a map"))?;
                for (name, value) in pairs {
                    self.http.cookies().set(Cookie::new(name, value, ""));
                }
            }
            "http-proxy" => {
                let proxy = match value {
                    OptionValue::Null => None,
                    other => {
                        let url = other.as_str().ok_or_else(|| invalid("expected a proxy URL"))?;
                        Some(ProxyConfig::from_url(url)?)
                    }
                };
                self.http.set_proxy(proxy)?;
            }
            "http-timeout" => {
                let timeout = value.as_duration().ok_or_else(|| invalid("expected seconds"))?;
                self.http.set_timeout(timeout)?;
            }
            "http-ssl-verify" => {
                let verify = value.as_bool().ok_or_else(|| invalid("expected a bool"))?;
                self.http.set_ssl_verify(verify)?;
            }
            "http-trust-env" => {
                let trust = value.as_bool().ok_or_else(|| invalid("expected a bool"))?;
                self.http.set_trust_env(trust)?;
            }
            "http-disable-dh" => debug!("http-disable-dh has no effect with rustls"),
            _ => {}
        }
        Ok(())
    }

    /// Register a plugin, replacing any plugin with the same name.
    pub fn register_plugin(&self, descriptor: PluginDescriptor) {
        let name = descriptor.name.clone();
        if self.registry.write().register(descriptor).is_some() {
            info!(plugin = %name, "Plugin overridden");
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.registry.read().names().map(str::to_string).collect()
    }

    /// Load the manifest plugins of `dir`. Returns how many were registered.
    pub async fn load_plugins(&self, dir: &Path) -> Result<usize, PluginError> {
        let descriptors = plugins::load_plugins(dir).await?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register_plugin(descriptor);
        }
        Ok(count)
    }

    /// Install the muxer used by muxed streams.
    pub fn set_muxer(&self, muxer: Option<Arc<dyn Muxer>>) {
        self.streams.set_muxer(muxer);
    }

    /// Find the plugin for `url` without touching the network.
    pub fn resolve_url_no_redirect(&self, url: &str) -> Result<ResolvedUrl, PluginError> {
        let url = with_scheme(url);
        let plugin = self
            .registry
            .read()
            .resolve(&url)
            .ok_or_else(|| PluginError::NoPlugin { url: url.clone() })?;
        debug!(url = %url, plugin = %plugin.descriptor.name, "Resolved URL");
        Ok(ResolvedUrl {
            name: plugin.descriptor.name.clone(),
            plugin,
            url,
        })
    }

    /// Find the plugin for `url`. When none matches, follow HTTP redirects
    /// once and try the final URL.
    pub async fn resolve_url(&self, url: &str) -> Result<ResolvedUrl, PluginError> {
        match self.resolve_url_no_redirect(url) {
            Ok(resolved) => Ok(resolved),
            Err(PluginError::NoPlugin { url }) => {
                let response = match self
                    .http
                    .request(&url, RequestOptions::method(Method::HEAD))
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(url = %url, error = %e, "Redirect lookup failed");
                        return Err(PluginError::NoPlugin { url });
                    }
                };
                let final_url = response.url().to_string();
                if final_url == url {
                    return Err(PluginError::NoPlugin { url });
                }
                debug!(from = %url, to = %final_url, "Following redirect");
                self.resolve_url_no_redirect(&final_url)
                    .map_err(|_| PluginError::NoPlugin { url })
            }
            Err(e) => Err(e),
        }
    }

    /// Instantiate the plugin for `url`.
    pub async fn plugin_for(&self, url: &str) -> Result<Box<dyn Plugin>, PluginError> {
        let resolved = self.resolve_url(url).await?;
        let ctx = PluginContext {
            url: resolved.url,
            name: resolved.name.clone(),
            captures: resolved.plugin.captures,
            matches: resolved.plugin.matches,
            http: self.http.clone(),
            options: self.options.clone(),
            streams: self.streams.with_plugin(&resolved.name),
            metadata: Metadata::default(),
        };
        resolved.plugin.descriptor.instantiate(ctx)
    }

    /// Resolve `url` and name its streams.
    pub async fn streams(&self, url: &str, options: StreamsOptions) -> Result<StreamMap, PluginError> {
        let mut plugin = self.plugin_for(url).await?;
        self.plugin_streams(plugin.as_mut(), options).await
    }

    /// Name the streams of an instantiated plugin.
    pub async fn plugin_streams(
        &self,
        plugin: &mut dyn Plugin,
        options: StreamsOptions,
    ) -> Result<StreamMap, PluginError> {
        let found = plugin.streams().await?;
        let stream_types = options.stream_types.clone().or_else(|| {
            self.options
                .read()
                .get("stream-types")
                .and_then(OptionValue::as_string_list)
                .filter(|types| !types.is_empty())
        });
        let map = build_stream_map(found, stream_types.as_deref(), &options.sorting_excludes)?;
        if map.is_empty() {
            return Err(PluginError::NoStreams {
                url: plugin.context().url.clone(),
            });
        }
        info!(
            plugin = %plugin.name(),
            streams = ?map.names().collect::<Vec<_>>(),
            "Found streams"
        );
        Ok(map)
    }

    /// Rebuild a stream from its JSON description.
    pub fn stream_from_json(&self, value: &serde_json::Value) -> Result<StreamRef, PluginError> {
        let descriptor = StreamDescriptor::deserialize(value)?;
        Ok(descriptor.into_stream(&self.streams)?)
    }
}

/// JSON description of a stream.
pub fn stream_to_json(stream: &StreamRef) -> Result<serde_json::Value, PluginError> {
    Ok(serde_json::to_value(stream.descriptor())?)
}

fn sortable_weight(name: &str, total: usize) -> f64 {
    match stream_weight(name).0 {
        w if w > 0.0 => w,
        _ if total == 1 => 1.0,
        _ => 0.0,
    }
}

fn build_stream_map(
    mut found: Vec<(String, StreamRef)>,
    stream_types: Option<&[String]>,
    sorting_excludes: &[String],
) -> Result<StreamMap, PluginError> {
    if let Some(types) = stream_types {
        found.retain(|(_, s)| types.iter().any(|t| t == s.shortname()));
        found.sort_by_key(|(_, s)| types.iter().position(|t| t == s.shortname()));
    }

    let mut named: Vec<(String, StreamRef)> = Vec::with_capacity(found.len());
    let taken = |named: &[(String, StreamRef)], name: &str| named.iter().any(|(n, _)| n == name);
    for (mut name, stream) in found {
        if let Some((_, existing)) = named.iter().find(|(n, _)| *n == name) {
            if existing.shortname() != stream.shortname() {
                name = format!("{name}_{}", stream.shortname());
            }
            if taken(&named, &name) {
                name = format!("{name}_alt");
                let alts = named.iter().filter(|(n, _)| n.starts_with(&name)).count();
                if alts >= 2 {
                    debug!(name = %name, "Dropping surplus alternate stream");
                    continue;
                } else if alts > 0 {
                    name = format!("{name}{}", alts + 1);
                }
            }
        }
        let Some(valid) = NAME_RE.find(&name) else {
            warn!(name = %name, "Dropping stream with invalid name");
            continue;
        };
        let name = valid.as_str().to_string();
        if is_alias(&name) || taken(&named, &name) {
            warn!(name = %name, "Dropping stream with reserved or duplicate name");
            continue;
        }
        named.push((name, stream));
    }

    let total = named.len();
    let mut ranked: Vec<&str> = named
        .iter()
        .map(|(n, _)| n.as_str())
        .filter(|n| sortable_weight(n, total) > 0.0)
        .collect();
    ranked.sort_by(|a, b| sortable_weight(a, total).total_cmp(&sortable_weight(b, total)));

    let filters = sorting_excludes
        .iter()
        .map(|expr| SortingFilter::parse(expr))
        .collect::<Result<Vec<_>, _>>()?;
    let kept: Vec<&str> = ranked
        .iter()
        .copied()
        .filter(|n| filters.iter().all(|f| f.keep(n)))
        .collect();

    let lookup: BTreeMap<&str, &StreamRef> = named.iter().map(|(n, s)| (n.as_str(), s)).collect();
    let mut aliases: Vec<(String, StreamRef)> = Vec::new();
    let mut alias = |alias: &str, name: Option<&&str>| {
        if let Some(stream) = name.and_then(|n| lookup.get(*n)) {
            aliases.push((alias.to_string(), Arc::clone(stream)));
        }
    };
    alias("worst", kept.first());
    alias("best", kept.last());
    if ranked.first() != kept.first() {
        alias("worst-unfiltered", ranked.first());
    }
    if ranked.last() != kept.last() {
        alias("best-unfiltered", ranked.last());
    }

    let mut entries = named.clone();
    entries.sort_by(|(a, _), (b, _)| sortable_weight(a, total).total_cmp(&sortable_weight(b, total)));
    entries.extend(aliases);
    Ok(StreamMap { entries })
}
