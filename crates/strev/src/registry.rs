//! Plugin registry and URL dispatch.
//!
//! Plugins are plain values: a name, a default priority, a list of URL
//! matchers, and a factory that builds an instance for one URL. The
//! registry picks the single best (plugin, matcher) pair for a URL.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, trace};

use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};

pub const NO_PRIORITY: i32 = 0;
pub const LOW_PRIORITY: i32 = 10;
pub const NORMAL_PRIORITY: i32 = 20;
pub const HIGH_PRIORITY: i32 = 30;
pub const HIGHEST_PRIORITY: i32 = 40;

/// A URL pattern. Matching is anchored at the start of the URL.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: Option<String>,
    pub pattern: Regex,
    /// Falls back to the plugin priority when unset.
    pub priority: Option<i32>,
}

impl Matcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: None,
            pattern: Regex::new(pattern)?,
            priority: None,
        })
    }

    pub fn named(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: Some(name.into()),
            ..Self::new(pattern)?
        })
    }

    pub fn from_regex(pattern: Regex) -> Self {
        Self {
            name: None,
            pattern,
            priority: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Named groups of a match starting at offset 0.
    pub fn captures(&self, url: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.pattern.captures(url)?;
        if caps.get(0).map(|m| m.start()) != Some(0) {
            return None;
        }
        Some(
            self.pattern
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect(),
        )
    }
}

pub type PluginFactory =
    Arc<dyn Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub priority: i32,
    pub matchers: Vec<Matcher>,
    factory: PluginFactory,
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

impl PluginDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority: NORMAL_PRIORITY,
            matchers: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn instantiate(&self, ctx: PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
        (self.factory)(ctx)
    }

    fn effective_priority(&self, matcher: &Matcher) -> i32 {
        matcher.priority.unwrap_or(self.priority)
    }
}

/// Result of dispatching a URL.
#[derive(Debug, Clone)]
pub struct PluginMatch {
    pub descriptor: Arc<PluginDescriptor>,
    /// Named groups of the winning matcher.
    pub captures: BTreeMap<String, String>,
    /// Which named matchers of the plugin fired.
    pub matches: BTreeMap<String, bool>,
    /// Index of the winning matcher.
    pub matcher: usize,
    pub priority: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin. A plugin with the same name is replaced, and the
    /// replacement counts as the newest registration.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Option<Arc<PluginDescriptor>> {
        let previous = self.unregister(&descriptor.name);
        if previous.is_some() {
            debug!(plugin = %descriptor.name, "Replacing registered plugin");
        }
        self.plugins.push(Arc::new(descriptor));
        previous
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<PluginDescriptor>> {
        let index = self.plugins.iter().position(|p| p.name == name)?;
        Some(self.plugins.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PluginDescriptor>> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Pick the matching (plugin, matcher) pair with the highest effective
    /// priority. Ties go to the earlier registration, then the earlier matcher.
    pub fn resolve(&self, url: &str) -> Option<PluginMatch> {
        let mut best: Option<PluginMatch> = None;
        for descriptor in &self.plugins {
            let mut matches = BTreeMap::new();
            let mut winner: Option<(usize, i32, BTreeMap<String, String>)> = None;
            for (index, matcher) in descriptor.matchers.iter().enumerate() {
                let captures = matcher.captures(url);
                if let Some(name) = &matcher.name {
                    matches.insert(name.clone(), captures.is_some());
                }
                let Some(captures) = captures else { continue };
                let priority = descriptor.effective_priority(matcher);
                trace!(plugin = %descriptor.name, matcher = index, priority, "Matcher fired");
                if winner.as_ref().is_none_or(|(_, p, _)| priority > *p) {
                    winner = Some((index, priority, captures));
                }
            }

            let Some((matcher, priority, captures)) = winner else {
                continue;
            };
            if best.as_ref().is_none_or(|b| priority > b.priority) {
                best = Some(PluginMatch {
                    descriptor: descriptor.clone(),
                    captures,
                    matches,
                    matcher,
                    priority,
                });
            }
        }
        best
    }
}
