//! Shared HTTP client.
//!
//! One [`HttpSession`] is owned by the session and cloned into every plugin
//! and stream. It wraps two reqwest clients (redirect-following and not),
//! a cookie jar, and the retry policy. Configuration changes rebuild the
//! clients in place; clones observe the new clients on their next request.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

use crate::config::HttpConfig;
use crate::cookies::CookieJar;
use crate::error::HttpError;
use crate::proxy::{ProxyConfig, build_proxy_from_config};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Create a reqwest Client with the provided configuration.
///
/// The total request timeout is not set on the client; [`HttpSession`]
/// applies `config.timeout` per request so that streamed bodies can opt out.
pub fn create_client(config: &HttpConfig, follow_redirects: bool) -> Result<Client, HttpError> {
    install_rustls_provider();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .danger_accept_invalid_certs(!config.ssl_verify)
        .redirect(if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if let Some(tls_config) = &config.tls_config {
        client_builder = client_builder.use_preconfigured_tls(tls_config.clone());
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        // Explicit proxy configuration takes precedence
        let proxy = build_proxy_from_config(proxy_config)?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if !config.use_system_proxy {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder.build().map_err(HttpError::from)
}

/// Request body variants that can be rebuilt for every retry.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Raw(Bytes),
}

/// Total time budget of one request, body included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestTimeout {
    /// The session's configured timeout.
    #[default]
    Session,
    Total(Duration),
    /// Only the connect phase is bounded. Used for bodies that are read
    /// for as long as the consumer keeps up.
    Unbounded,
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: RequestTimeout,
    pub retry: RetryPolicy,
    /// Statuses returned to the caller instead of raised.
    pub acceptable_status: Vec<u16>,
    pub raise_for_status: bool,
    pub allow_redirects: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            timeout: RequestTimeout::Session,
            retry: RetryPolicy::no_retry(),
            acceptable_status: Vec::new(),
            raise_for_status: true,
            allow_redirects: true,
            cancel: None,
        }
    }
}

impl RequestOptions {
    pub fn method(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = RequestTimeout::Total(timeout);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.timeout = RequestTimeout::Unbounded;
        self
    }

    /// Retry transient failures `retries` times with exponential back-off.
    pub fn retries(mut self, retries: u32, base: Duration, cap: Duration) -> Self {
        self.retry = RetryPolicy {
            max_retries: retries,
            base_delay: base,
            max_delay: cap,
            jitter: false,
        };
        self
    }

    pub fn acceptable_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.acceptable_status.extend(statuses);
        self
    }

    pub fn raise_for_status(mut self, raise: bool) -> Self {
        self.raise_for_status = raise;
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug)]
struct Clients {
    config: HttpConfig,
    client: Client,
    no_redirect: Client,
}

impl Clients {
    fn build(config: HttpConfig) -> Result<Self, HttpError> {
        let client = create_client(&config, config.follow_redirects)?;
        let no_redirect = create_client(&config, false)?;
        Ok(Self {
            config,
            client,
            no_redirect,
        })
    }
}

#[derive(Debug)]
struct Inner {
    clients: RwLock<Clients>,
    cookies: CookieJar,
}

/// Thread-safe, cheaply clonable HTTP session.
#[derive(Debug, Clone)]
pub struct HttpSession {
    inner: Arc<Inner>,
}

impl HttpSession {
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        Ok(Self {
            inner: Arc::new(Inner {
                clients: RwLock::new(Clients::build(config)?),
                cookies: CookieJar::new(),
            }),
        })
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.inner.cookies
    }

    pub fn config(&self) -> HttpConfig {
        self.inner.clients.read().config.clone()
    }

    /// Apply `update` to the configuration and rebuild the clients.
    pub fn update_config(&self, update: impl FnOnce(&mut HttpConfig)) -> Result<(), HttpError> {
        let mut config = self.config();
        update(&mut config);
        let rebuilt = Clients::build(config)?;
        *self.inner.clients.write() = rebuilt;
        Ok(())
    }

    pub fn set_headers(&self, headers: HeaderMap) -> Result<(), HttpError> {
        self.update_config(|cfg| {
            for (name, value) in headers.iter() {
                cfg.headers.insert(name.clone(), value.clone());
            }
        })
    }

    pub fn set_params(&self, params: Vec<(String, String)>) -> Result<(), HttpError> {
        self.update_config(|cfg| cfg.params = params)
    }

    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<(), HttpError> {
        self.update_config(|cfg| cfg.proxy = proxy)
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), HttpError> {
        self.update_config(|cfg| cfg.timeout = timeout)
    }

    pub fn set_ssl_verify(&self, verify: bool) -> Result<(), HttpError> {
        self.update_config(|cfg| cfg.ssl_verify = verify)
    }

    pub fn set_trust_env(&self, trust: bool) -> Result<(), HttpError> {
        self.update_config(|cfg| cfg.use_system_proxy = trust)
    }

    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(url, RequestOptions::default()).await
    }

    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.request(url, RequestOptions::method(Method::HEAD)).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(
            url,
            RequestOptions {
                method: Method::POST,
                ..options
            },
        )
        .await
    }

    pub async fn get_text(&self, url: &str, options: RequestOptions) -> Result<String, HttpError> {
        let response = self.request(url, options).await?;
        response
            .text()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    pub async fn get_bytes(&self, url: &str, options: RequestOptions) -> Result<Bytes, HttpError> {
        let response = self.request(url, options).await?;
        response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        let response = self.request(url, options).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    /// Send a request, retrying transient failures per `options.retry`.
    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        let parsed = Url::parse(url).map_err(|e| HttpError::invalid_url(url, e.to_string()))?;
        let token = options.cancel.clone().unwrap_or_default();

        retry_with_backoff(&options.retry, &token, |attempt| {
            let parsed = parsed.clone();
            let options = &options;
            async move {
                if attempt > 0 {
                    trace!(url = %parsed, attempt, "Retrying request");
                }
                RetryAction::from_http(self.send_once(&parsed, options).await)
            }
        })
        .await
    }

    async fn send_once(&self, url: &Url, options: &RequestOptions) -> Result<Response, HttpError> {
        let (client, params, session_timeout) = {
            let clients = self.inner.clients.read();
            let client = if options.allow_redirects {
                clients.client.clone()
            } else {
                clients.no_redirect.clone()
            };
            (client, clients.config.params.clone(), clients.config.timeout)
        };

        let mut builder = client
            .request(options.method.clone(), url.clone())
            .headers(options.headers.clone());
        if !params.is_empty() {
            builder = builder.query(&params);
        }
        if !options.params.is_empty() {
            builder = builder.query(&options.params);
        }
        if !options.headers.contains_key(COOKIE)
            && let Some(cookie) = self.inner.cookies.header_for(url)
        {
            builder = builder.header(COOKIE, cookie);
        }
        let timeout = match options.timeout {
            RequestTimeout::Session => Some(session_timeout).filter(|t| !t.is_zero()),
            RequestTimeout::Total(timeout) => Some(timeout),
            RequestTimeout::Unbounded => None,
        };
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &options.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            Some(RequestBody::Raw(bytes)) => builder.body(bytes.clone()),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(url.as_str(), e))?;

        self.inner
            .cookies
            .store_response(response.url(), response.headers());

        let status = response.status();
        trace!(url = %url, status = status.as_u16(), "HTTP response");
        if options.raise_for_status
            && is_error_status(status)
            && !options.acceptable_status.contains(&status.as_u16())
        {
            return Err(HttpError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

fn is_error_status(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}
