mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use bytes::Bytes;
use futures::StreamExt;
use mesio_engine::{
    HttpConfig, HttpError, HttpSession, HttpStream, RequestOptions, Stream, StreamReader, read_to_end,
};

use common::{context, init_tracing, serve, session};

async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
        (StatusCode::SERVICE_UNAVAILABLE, "busy")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// Two chunks with a pause longer than a second between them.
async fn slow() -> Body {
    let chunks = futures::stream::iter([&b"first-"[..], &b"second"[..]])
        .enumerate()
        .then(|(i, chunk)| async move {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            }
            Ok::<_, std::io::Error>(Bytes::from_static(chunk))
        });
    Body::from_stream(chunks)
}

fn app(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/login",
            get(|| async { ([(header::SET_COOKIE, "sid=abc123; Path=/")], "welcome") }),
        )
        .route(
            "/whoami",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("anonymous")
                    .to_string()
            }),
        )
        .route("/flaky", get(flaky))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
        .route("/old", get(|| async { Redirect::temporary("/new") }))
        .route("/new", get(|| async { "new" }))
        .route(
            "/echo",
            get(|axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
                query.unwrap_or_default()
            }),
        )
        .route("/body", get(|| async { vec![7u8; 64 * 1024] }))
        .route("/slow", get(slow))
        .with_state(hits)
}

#[tokio::test]
async fn cookies_are_stored_and_sent() {
    init_tracing();
    let base = serve(app(Arc::default())).await;
    let http = session();

    let anonymous = http.get_text(&format!("{base}/whoami"), RequestOptions::default()).await.unwrap();
    assert_eq!(anonymous, "anonymous");

    http.get(&format!("{base}/login")).await.unwrap();
    assert_eq!(http.cookies().get("sid").as_deref(), Some("abc123"));

    let known = http.get_text(&format!("{base}/whoami"), RequestOptions::default()).await.unwrap();
    assert_eq!(known, "sid=abc123");
}

#[tokio::test]
async fn transient_statuses_are_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(app(hits.clone())).await;
    let http = session();

    let options = RequestOptions::default().retries(3, Duration::from_millis(10), Duration::from_millis(50));
    let body = http.get_text(&format!("{base}/flaky"), options).await.unwrap();
    assert_eq!(body, "ok");
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    hits.store(0, Ordering::SeqCst);
    let err = http.get(&format!("{base}/flaky")).await.unwrap_err();
    assert!(matches!(err, HttpError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acceptable_status_is_returned() {
    let base = serve(app(Arc::default())).await;
    let http = session();
    let url = format!("{base}/missing");

    assert!(http.get(&url).await.is_err());

    let response = http
        .request(&url, RequestOptions::default().acceptable_status([404]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = http
        .request(&url, RequestOptions::default().raise_for_status(false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn redirects_can_be_disabled() {
    let base = serve(app(Arc::default())).await;
    let http = session();
    let url = format!("{base}/old");

    let followed = http.get_text(&url, RequestOptions::default()).await.unwrap();
    assert_eq!(followed, "new");

    let response = http
        .request(&url, RequestOptions::default().allow_redirects(false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()[header::LOCATION], "/new");
}

#[tokio::test]
async fn session_query_params_are_appended() {
    let base = serve(app(Arc::default())).await;
    let http = session();
    http.set_params(vec![("token".into(), "t1".into())]).unwrap();

    let query = http
        .get_text(&format!("{base}/echo"), RequestOptions::default().param("page", "2"))
        .await
        .unwrap();
    assert_eq!(query, "token=t1&page=2");
}

#[tokio::test]
async fn http_stream_reads_whole_body() {
    let base = serve(app(Arc::default())).await;
    let stream = HttpStream::new(context(), format!("{base}/body"));
    assert_eq!(stream.shortname(), "http");

    let mut reader = stream.open().await.unwrap();
    let body = read_to_end(reader.as_mut()).await.unwrap();
    assert_eq!(body.len(), 64 * 1024);
    assert!(body.iter().all(|b| *b == 7));
    reader.close().await;

    let missing = HttpStream::new(context(), format!("{base}/missing"));
    assert!(missing.open().await.is_err());
}

#[tokio::test]
async fn unbounded_requests_outlive_the_session_timeout() {
    let base = serve(app(Arc::default())).await;
    let http = HttpSession::new(HttpConfig {
        use_system_proxy: false,
        timeout: Duration::from_secs(1),
        ..HttpConfig::default()
    })
    .unwrap();
    let url = format!("{base}/slow");

    assert!(http.get_bytes(&url, RequestOptions::default()).await.is_err());

    let body = http
        .get_bytes(&url, RequestOptions::default().unbounded())
        .await
        .unwrap();
    assert_eq!(&body[..], b"first-second");
}
