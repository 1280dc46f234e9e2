#![allow(dead_code)]

use axum::Router;
use mesio::HttpConfig;
use strev::Session;
use tokio::net::TcpListener;

pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn session() -> Session {
    Session::with_config(HttpConfig {
        use_system_proxy: false,
        ..HttpConfig::default()
    })
    .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strev=debug,mesio_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn vod_playlist(segments: &[&str]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for segment in segments {
        out.push_str("#EXTINF:4.0,\n");
        out.push_str(segment);
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}
