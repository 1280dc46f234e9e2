#![allow(dead_code)]

use axum::Router;
use mesio_engine::{HttpConfig, HttpSession, Options, StreamContext};
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn session() -> HttpSession {
    HttpSession::new(HttpConfig {
        use_system_proxy: false,
        ..HttpConfig::default()
    })
    .unwrap()
}

pub fn context() -> StreamContext {
    StreamContext::new(session(), Options::session().shared())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesio_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A VOD media playlist over `segments`, each 4 seconds long.
pub fn vod_playlist(segments: &[&str]) -> String {
    let mut out = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n",
    );
    for segment in segments {
        out.push_str("#EXTINF:4.0,\n");
        out.push_str(segment);
        out.push('\n');
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}
