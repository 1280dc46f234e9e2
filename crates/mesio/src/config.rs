use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Configuration of the session-wide HTTP client
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects by default
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Query parameters appended to every request
    pub params: Vec<(String, String)>,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system / environment proxy settings when no proxy is set
    pub use_system_proxy: bool,

    /// Verify TLS certificates
    pub ssl_verify: bool,

    /// Preconfigured TLS context replacing the default one
    pub tls_config: Option<rustls::ClientConfig>,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            params: Vec::new(),
            proxy: None,
            use_system_proxy: true,
            ssl_verify: true,
            tls_config: None,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    /// Build a config whose headers are the defaults overlaid with `config.headers`.
    pub fn with_config(config: HttpConfig) -> Self {
        let mut headers = HttpConfig::get_default_headers();
        for (name, value) in config.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        Self { headers, ..config }
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}
