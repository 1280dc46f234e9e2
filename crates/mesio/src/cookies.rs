//! Session-scoped cookie jar with optional JSON persistence.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::error::HttpError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Domain without a leading dot. Empty matches every host.
    pub domain: String,
    pub path: String,
    /// Only sent to exactly `domain` when set (no `Domain` attribute was given).
    #[serde(default)]
    pub host_only: bool,
    #[serde(default)]
    pub secure: bool,
    /// Expiry as a unix timestamp; session cookies have none.
    #[serde(default)]
    pub expires: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        let domain: String = domain.into();
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            path: "/".to_string(),
            host_only: false,
            secure: false,
            expires: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = self.domain.is_empty()
            || host == self.domain
            || (!self.host_only && host.ends_with(&format!(".{}", self.domain)));
        if !domain_ok {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let path = url.path();
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')))
    }

    /// Parse a `Set-Cookie` header received from `url`.
    pub fn parse_set_cookie(header: &str, url: &Url) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let host = url.host_str()?.to_ascii_lowercase();
        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            path: default_path(url),
            host_only: true,
            secure: false,
            expires: None,
        };

        let mut max_age = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    // Reject cookies for unrelated domains.
                    if host != domain && !host.ends_with(&format!(".{domain}")) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "secure" => cookie.secure = true,
                "max-age" => max_age = val.parse::<i64>().ok(),
                "expires" => {
                    cookie.expires = DateTime::parse_from_rfc2822(val)
                        .ok()
                        .map(|dt| dt.timestamp());
                }
                _ => {}
            }
        }
        if let Some(secs) = max_age {
            cookie.expires = Some(Utc::now().timestamp().saturating_add(secs));
        }
        Some(cookie)
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

type CookieKey = (String, String, String);

/// Thread-safe cookie store shared by every request of a session.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<FxHashMap<CookieKey, Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cookie: Cookie) {
        let key = (
            cookie.domain.clone(),
            cookie.path.clone(),
            cookie.name.clone(),
        );
        let mut cookies = self.cookies.lock();
        if cookie.is_expired(Utc::now().timestamp()) {
            cookies.remove(&key);
        } else {
            cookies.insert(key, cookie);
        }
    }

    /// First unexpired value stored under `name`, on any domain.
    pub fn get(&self, name: &str) -> Option<String> {
        let now = Utc::now().timestamp();
        self.cookies
            .lock()
            .values()
            .find(|c| c.name == name && !c.is_expired(now))
            .map(|c| c.value.clone())
    }

    pub fn remove(&self, name: &str) {
        self.cookies.lock().retain(|(_, _, n), _| n != name);
    }

    pub fn clear(&self) {
        self.cookies.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Cookie> {
        self.cookies.lock().values().cloned().collect()
    }

    /// Record every `Set-Cookie` header of a response from `url`.
    pub fn store_response(&self, url: &Url, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            match Cookie::parse_set_cookie(raw, url) {
                Some(cookie) => {
                    trace!(name = %cookie.name, domain = %cookie.domain, "Storing cookie");
                    self.set(cookie);
                }
                None => debug!(url = %url, "Ignoring malformed Set-Cookie header"),
            }
        }
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn header_for(&self, url: &Url) -> Option<HeaderValue> {
        let now = Utc::now().timestamp();
        let mut cookies = self.cookies.lock();
        cookies.retain(|_, c| !c.is_expired(now));

        let mut matching: Vec<&Cookie> = cookies.values().filter(|c| c.matches(url)).collect();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first.
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.name.cmp(&b.name)));
        let value = matching
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&value).ok()
    }

    /// Persist every non-session cookie as JSON.
    pub fn save(&self, path: &Path) -> Result<(), HttpError> {
        let persistent: Vec<Cookie> = self
            .all()
            .into_iter()
            .filter(|c| c.expires.is_some())
            .collect();
        let json = serde_json::to_vec_pretty(&persistent)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), count = persistent.len(), "Saved cookie jar");
        Ok(())
    }

    /// Merge cookies previously written by [`CookieJar::save`].
    pub fn load(&self, path: &Path) -> Result<usize, HttpError> {
        let data = std::fs::read(path)?;
        let cookies: Vec<Cookie> = serde_json::from_slice(&data)?;
        let count = cookies.len();
        for cookie in cookies {
            self.set(cookie);
        }
        debug!(path = %path.display(), count, "Loaded cookie jar");
        Ok(count)
    }
}
