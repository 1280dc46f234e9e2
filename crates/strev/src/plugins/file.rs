//! `file://` URLs.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use mesio::{FileStream, StreamRef};
use regex::Regex;
use url::Url;

use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};
use crate::registry::{Matcher, NORMAL_PRIORITY, PluginDescriptor};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^file://(?P<path>.+)$").unwrap());

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new("file", |ctx| Ok(Box::new(FilePlugin { ctx }) as Box<dyn Plugin>))
        .with_priority(NORMAL_PRIORITY)
        .with_matcher(Matcher::from_regex(URL_RE.clone()))
}

pub struct FilePlugin {
    ctx: PluginContext,
}

#[async_trait]
impl Plugin for FilePlugin {
    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    async fn streams(&mut self) -> Result<Vec<(String, StreamRef)>, PluginError> {
        let path = Url::parse(&self.ctx.url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .or_else(|| self.ctx.capture("path").map(PathBuf::from))
            .ok_or_else(|| PluginError::plugin(format!("invalid file URL: {}", self.ctx.url)))?;
        Ok(vec![("live".to_string(), Arc::new(FileStream::new(path)) as StreamRef)])
    }
}
