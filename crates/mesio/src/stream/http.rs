use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Method;
use reqwest::header::HeaderMap;
use tracing::{debug, info};
use url::Url;

use super::{BoxReader, Stream, StreamContext, StreamDescriptor, StreamReader, headers_to_map};
use crate::error::{HttpError, StreamError};
use crate::http::RequestOptions;

/// Plain HTTP body served as one stream.
#[derive(Debug, Clone)]
pub struct HttpStream {
    ctx: StreamContext,
    method: Method,
    url: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
}

impl HttpStream {
    pub fn new(ctx: StreamContext, url: impl Into<String>) -> Self {
        Self {
            ctx,
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            params: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    /// URL with the stream's query parameters applied.
    fn effective_url(&self) -> Result<Url, StreamError> {
        let mut url = Url::parse(&self.url).map_err(|e| HttpError::invalid_url(&self.url, e.to_string()))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Stream for HttpStream {
    fn shortname(&self) -> &'static str {
        "http"
    }

    async fn open(&self) -> Result<BoxReader, StreamError> {
        let url = self.effective_url()?;
        let timeout = self
            .ctx
            .resolve_option("stream-timeout", None)
            .and_then(|v| v.as_duration());

        info!(url = %url, method = %self.method, "Opening HTTP stream");
        // Reads are bounded by `stream-timeout` instead of a total budget.
        let options = RequestOptions {
            headers: self.headers.clone(),
            ..RequestOptions::method(self.method.clone())
        }
        .unbounded();
        let response = self.ctx.http.request(url.as_str(), options).await?;
        debug!(
            status = response.status().as_u16(),
            length = ?response.content_length(),
            "HTTP stream connected"
        );

        let url = url.to_string();
        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|e| HttpError::from_reqwest(&url, e)))
            .boxed();
        Ok(Box::new(BytesStreamReader::new(stream, timeout)))
    }

    fn to_url(&self) -> Result<String, StreamError> {
        Ok(self.effective_url()?.to_string())
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::Http {
            method: self.method.to_string(),
            url: self
                .effective_url()
                .map(|u| u.to_string())
                .unwrap_or_else(|_| self.url.clone()),
            headers: headers_to_map(&self.headers),
        }
    }
}

/// Pull-based reader over a chunked body.
pub(crate) struct BytesStreamReader {
    stream: Option<BoxStream<'static, Result<Bytes, HttpError>>>,
    current_chunk: Bytes,
    timeout: Option<Duration>,
}

impl BytesStreamReader {
    pub(crate) fn new(
        stream: BoxStream<'static, Result<Bytes, HttpError>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream: Some(stream),
            current_chunk: Bytes::new(),
            timeout,
        }
    }
}

#[async_trait]
impl StreamReader for BytesStreamReader {
    async fn read(&mut self, n: usize) -> Result<Bytes, StreamError> {
        loop {
            if !self.current_chunk.is_empty() {
                let take = n.min(self.current_chunk.len());
                return Ok(self.current_chunk.split_to(take));
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(Bytes::new());
            };
            let next = match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, stream.next())
                    .await
                    .map_err(|_| StreamError::ReadTimeout)?,
                None => stream.next().await,
            };
            match next {
                Some(Ok(chunk)) => self.current_chunk = chunk,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.into());
                }
                None => {
                    self.stream = None;
                    return Ok(Bytes::new());
                }
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
        self.current_chunk = Bytes::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::http::HttpSession;
    use crate::options::Options;
    use crate::stream::read_to_end;
    use futures::stream;

    #[tokio::test]
    async fn reader_splits_chunks() {
        let chunks: Vec<Result<Bytes, HttpError>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let mut reader = BytesStreamReader::new(stream::iter(chunks).boxed(), None);
        assert_eq!(reader.read(3).await.unwrap(), Bytes::from_static(b"hel"));
        assert_eq!(read_to_end(&mut reader).await.unwrap(), Bytes::from_static(b"lo world"));
        assert!(reader.read(3).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reader_times_out_on_stalled_body() {
        let mut reader =
            BytesStreamReader::new(stream::pending::<Result<Bytes, HttpError>>().boxed(), Some(Duration::from_secs(1)));
        assert!(matches!(reader.read(8).await, Err(StreamError::ReadTimeout)));
    }

    #[test]
    fn url_includes_params() {
        let ctx = StreamContext::new(
            HttpSession::new(HttpConfig::default()).unwrap(),
            Options::session().shared(),
        );
        let stream = HttpStream::new(ctx, "https://example.com/live.flv?a=1")
            .with_params(vec![("token".into(), "x y".into())]);
        assert_eq!(
            stream.to_url().unwrap(),
            "https://example.com/live.flv?a=1&token=x+y"
        );
        match stream.descriptor() {
            StreamDescriptor::Http { url, method, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(url, "https://example.com/live.flv?a=1&token=x+y");
            }
            other => panic!("unexpected descriptor {other:?}"),
        }
    }
}
