use std::collections::BTreeMap;

use async_trait::async_trait;
use mesio::{HttpSession, OptionValue, RequestOptions, SharedOptions, StreamContext, StreamRef};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PluginError;
use crate::validate::ResponseSchema;

/// Optional facts a plugin may fill in while resolving streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
}

/// Everything a plugin instance is constructed with.
///
/// `captures` holds the named groups of the matcher that won dispatch,
/// `matches` reports for every named matcher of the plugin whether it
/// matched the URL.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub url: String,
    pub name: String,
    pub captures: BTreeMap<String, String>,
    pub matches: BTreeMap<String, bool>,
    pub http: HttpSession,
    pub options: SharedOptions,
    pub streams: StreamContext,
    pub metadata: Metadata,
}

impl PluginContext {
    pub fn capture(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }

    /// Whether the named matcher fired.
    pub fn matched(&self, matcher: &str) -> bool {
        self.matches.get(matcher).copied().unwrap_or(false)
    }

    /// Option value in this plugin's namespace.
    pub fn option(&self, key: &str) -> Option<OptionValue> {
        self.options.read().resolve(key, Some(&self.name), None)
    }

    /// Fetch `url` and run the body through `schema`.
    ///
    /// Transport failures stay [`PluginError::Http`]; a body that does not
    /// validate becomes [`PluginError::Validation`].
    pub async fn get_validated<T: 'static>(
        &self,
        url: &str,
        options: RequestOptions,
        schema: &ResponseSchema<T>,
    ) -> Result<T, PluginError> {
        let body = self.http.get_text(url, options).await?;
        debug!(plugin = %self.name, url, len = body.len(), "Validating response");
        Ok(schema.parse(&body)?)
    }
}

/// A URL extractor.
///
/// Implementations read the page or API behind [`PluginContext::url`] and
/// return the playable streams keyed by quality name. Streams are returned
/// unopened; the background work belongs to the reader each one opens.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn context(&self) -> &PluginContext;

    async fn streams(&mut self) -> Result<Vec<(String, StreamRef)>, PluginError>;

    fn metadata(&self) -> &Metadata {
        &self.context().metadata
    }

    fn name(&self) -> &str {
        &self.context().name
    }
}
