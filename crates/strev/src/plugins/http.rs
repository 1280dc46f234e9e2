//! `httpstream://` URLs served as a single HTTP body.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use mesio::{HttpStream, OptionValue, StreamRef};
use regex::Regex;
use reqwest::Method;

use super::{parse_params, with_scheme};
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginContext};
use crate::registry::{Matcher, NORMAL_PRIORITY, PluginDescriptor};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^httpstream://(?P<url>\S+)(?:\s(?P<params>.+))?$").unwrap()
});

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new("http", |ctx| Ok(Box::new(HttpPlugin { ctx }) as Box<dyn Plugin>))
        .with_priority(NORMAL_PRIORITY)
        .with_matcher(Matcher::from_regex(URL_RE.clone()))
}

pub struct HttpPlugin {
    ctx: PluginContext,
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn context(&self) -> &PluginContext {
        &self.ctx
    }

    /// `method=` picks the request method; other parameters become query
    /// parameters of the request.
    async fn streams(&mut self) -> Result<Vec<(String, StreamRef)>, PluginError> {
        let url = self
            .ctx
            .capture("url")
            .map(with_scheme)
            .ok_or_else(|| PluginError::plugin("missing stream URL"))?;
        let mut params = self
            .ctx
            .capture("params")
            .map(parse_params)
            .transpose()?
            .unwrap_or_default();

        let mut stream = HttpStream::new(self.ctx.streams.clone(), url);
        if let Some(method) = params.remove("method") {
            let method = method
                .as_str()
                .and_then(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
                .ok_or_else(|| PluginError::plugin(format!("invalid HTTP method {method:?}")))?;
            stream = stream.with_method(method);
        }
        let query = params
            .into_iter()
            .map(|(key, value)| (key, display(&value)))
            .collect();
        stream = stream.with_params(query);

        Ok(vec![("live".to_string(), Arc::new(stream) as StreamRef)])
    }
}

fn display(value: &OptionValue) -> String {
    match value {
        OptionValue::Null => String::new(),
        OptionValue::Bool(b) => b.to_string(),
        OptionValue::Int(i) => i.to_string(),
        OptionValue::Float(f) => f.to_string(),
        OptionValue::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
