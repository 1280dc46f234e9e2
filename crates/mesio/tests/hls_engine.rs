mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use mesio_engine::hls::UriPatternFilter;
use mesio_engine::{
    BoxReader, HlsStream, Muxer, OptionMap, OptionValue, Stream, StreamContext, StreamDescriptor,
    StreamError, read_to_end,
};

use common::{context, init_tracing, serve, vod_playlist};

const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=640x360,AUDIO=\"aud\"
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1600000,RESOLUTION=1280x720,FRAME-RATE=60.000,AUDIO=\"aud\"
high/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=100000,URI=\"iframes.m3u8\"
";

const SUBTITLED: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio/en.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"English\",LANGUAGE=\"en\",URI=\"subs/en.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"Deutsch\",LANGUAGE=\"de\",URI=\"subs/de.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=640x360,AUDIO=\"aud\",SUBTITLES=\"subs\"
low/index.m3u8
";

const BIG_SEGMENT: usize = 256 * 1024;

async fn segment(
    State(hits): State<Arc<AtomicUsize>>,
    Path((variant, name)): Path<(String, String)>,
) -> (StatusCode, String) {
    if name == "flaky.ts" && hits.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::BAD_GATEWAY, String::new());
    }
    (StatusCode::OK, format!("[{variant}/{name}]"))
}

fn app(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route("/master.m3u8", get(|| async { MASTER }))
        .route(
            "/low/index.m3u8",
            get(|| async { vod_playlist(&["s0.ts", "s1.ts", "s2.ts"]) }),
        )
        .route(
            "/high/index.m3u8",
            get(|| async { vod_playlist(&["s0.ts", "flaky.ts", "/ad/spot.ts", "s3.ts"]) }),
        )
        .route("/master-only.m3u8", get(|| async { MASTER }))
        .route("/subtitled.m3u8", get(|| async { SUBTITLED }))
        .route("/big/index.m3u8", get(|| async { vod_playlist(&["a.ts"]) }))
        .route("/big/a.ts", get(|| async { vec![b'x'; BIG_SEGMENT] }))
        .route("/{variant}/{name}", get(segment))
        .route("/ad/spot.ts", get(|| async { "[ad]" }))
        .with_state(hits)
}

#[tokio::test]
async fn vod_playlist_is_read_in_order() {
    init_tracing();
    let base = serve(app(Arc::default())).await;
    let stream = HlsStream::new(context(), format!("{base}/low/index.m3u8"));

    let mut reader = stream.open().await.unwrap();
    let body = read_to_end(reader.as_mut()).await.unwrap();
    assert_eq!(&body[..], b"[low/s0.ts][low/s1.ts][low/s2.ts]");
}

#[tokio::test]
async fn parallel_fetch_retries_and_filters() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = serve(app(hits.clone())).await;
    let options = OptionMap::from([
        ("hls-segment-threads".to_string(), OptionValue::Int(3)),
        ("hls-segment-attempts".to_string(), OptionValue::Int(3)),
    ]);
    let stream = HlsStream::new(context(), format!("{base}/high/index.m3u8"))
        .with_options(options)
        .with_filter(Arc::new(UriPatternFilter::new("/ad/").unwrap()));

    let mut reader = stream.open().await.unwrap();
    let body = read_to_end(reader.as_mut()).await.unwrap();
    assert_eq!(&body[..], b"[high/s0.ts][high/flaky.ts][high/s3.ts]");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn variants_are_named_from_master() {
    let base = serve(app(Arc::default())).await;
    let ctx = context();
    let url = format!("{base}/master.m3u8");

    let variants = HlsStream::parse_variant_playlist(&ctx, &url, Default::default())
        .await
        .unwrap();
    let names: Vec<_> = variants.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["360p", "720p60"]);
    assert_eq!(variants[1].stream.url(), format!("{base}/high/index.m3u8"));
    assert_eq!(variants[1].preferred_audio().map(|r| r.name.as_str()), Some("English"));

    let stream = variants.into_iter().next().unwrap().into_stream();
    assert_eq!(stream.shortname(), "hls");
    assert_eq!(stream.to_manifest_url().unwrap(), url);

    let err = HlsStream::parse_variant_playlist(&ctx, &format!("{base}/low/index.m3u8"), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Playlist(hls::PlaylistError::UnexpectedMedia)));

    let err = HlsStream::new(ctx, format!("{base}/master-only.m3u8")).open().await.err().unwrap();
    assert!(matches!(err, StreamError::Playlist(hls::PlaylistError::UnexpectedMaster)));
}

#[tokio::test]
async fn streamed_segments_survive_a_slow_reader() {
    let base = serve(app(Arc::default())).await;
    let options = OptionMap::from([
        ("hls-segment-stream-data".to_string(), OptionValue::Bool(true)),
        ("hls-segment-timeout".to_string(), OptionValue::Float(1.0)),
        ("ringbuffer-size".to_string(), OptionValue::Int(1024)),
    ]);
    let stream = HlsStream::new(context(), format!("{base}/big/index.m3u8")).with_options(options);

    let mut reader = stream.open().await.unwrap();
    // The writer blocks on the full buffer for longer than the segment timeout.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let body = read_to_end(reader.as_mut()).await.unwrap();
    assert_eq!(body.len(), BIG_SEGMENT);
    assert!(body.iter().all(|b| *b == b'x'));
}

/// Passes the first input through.
struct FirstInput;

#[async_trait]
impl Muxer for FirstInput {
    async fn mux(&self, mut inputs: Vec<BoxReader>) -> Result<BoxReader, StreamError> {
        Ok(inputs.remove(0))
    }
}

/// Playlist URLs behind the first variant of `url`.
async fn substream_urls(ctx: &StreamContext, url: &str) -> Vec<String> {
    let variant = HlsStream::parse_variant_playlist(ctx, url, Default::default())
        .await
        .unwrap()
        .remove(0);
    let hls_url = |descriptor: StreamDescriptor| match descriptor {
        StreamDescriptor::Hls { url, .. } => url,
        other => panic!("unexpected substream {other:?}"),
    };
    match variant.into_stream().descriptor() {
        StreamDescriptor::Muxed { substreams } => substreams.into_iter().map(hls_url).collect(),
        other => vec![hls_url(other)],
    }
}

#[tokio::test]
async fn subtitles_are_muxed_when_enabled() {
    let base = serve(app(Arc::default())).await;
    let ctx = context();
    ctx.set_muxer(Some(Arc::new(FirstInput)));
    let url = format!("{base}/subtitled.m3u8");

    assert_eq!(
        substream_urls(&ctx, &url).await,
        [format!("{base}/low/index.m3u8"), format!("{base}/audio/en.m3u8")]
    );

    ctx.options.write().set("mux-subtitles", true);
    let variants = HlsStream::parse_variant_playlist(&ctx, &url, Default::default())
        .await
        .unwrap();
    let languages: Vec<_> = variants[0]
        .subtitles
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(languages, ["English", "Deutsch"]);
    assert_eq!(
        substream_urls(&ctx, &url).await,
        [
            format!("{base}/low/index.m3u8"),
            format!("{base}/audio/en.m3u8"),
            format!("{base}/subs/en.m3u8"),
            format!("{base}/subs/de.m3u8"),
        ]
    );
}
