//! Network and session tests against a local HTTP server

use kadr_core::manifest::ByteRange;
use kadr_core::{
    AttachRequest, FetchError, HeadlessPlatform, HlsParser, HttpLoader, Loader, ManifestError,
    MemoryResumeStore, Notification, PlaybackState, PlayerConfig, PlayerSession, SegmentRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=426x240
240p/index.m3u8
";

const SHORT_MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:1
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:1.0,
seg0.ts
#EXTINF:1.0,
seg1.ts
#EXTINF:1.0,
seg2.ts
#EXT-X-ENDLIST
";

fn loader() -> Arc<HttpLoader> {
    Arc::new(HttpLoader::new(Duration::from_secs(5)).unwrap())
}

fn url(server: &MockServer, route: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), route)).unwrap()
}

async fn mount_text(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn wait_for_state(
    events: &mut broadcast::Receiver<Notification>,
    wanted: PlaybackState,
) -> Vec<PlaybackState> {
    let mut seen = Vec::new();
    loop {
        match events.recv().await {
            Ok(Notification::StateChanged { to, .. }) => {
                seen.push(to);
                if to == wanted {
                    return seen;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(e) => panic!("notification channel closed: {}", e),
        }
    }
}

// =============================================================================
// Loader
// =============================================================================

#[tokio::test]
async fn test_fetch_text() {
    let server = MockServer::start().await;
    mount_text(&server, "/master.m3u8", MASTER).await;

    let text = loader().fetch_text(&url(&server, "/master.m3u8")).await.unwrap();
    assert!(text.starts_with("#EXTM3U"));
}

#[tokio::test]
async fn test_fetch_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.m3u8"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = loader()
        .fetch_text(&url(&server, "/gone.m3u8"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(matches!(
        ManifestError::from(err),
        ManifestError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_byte_range_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all.ts"))
        .and(header("range", "bytes=0-99"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 100]))
        .expect(1)
        .mount(&server)
        .await;

    let request = SegmentRequest {
        url: url(&server, "/all.ts"),
        byte_range: Some(ByteRange {
            start: 0,
            length: 100,
        }),
    };
    let data = loader().fetch_segment(&request).await.unwrap();
    assert_eq!(data.len(), 100);
}

#[tokio::test]
async fn test_unreachable_host() {
    let request = SegmentRequest {
        url: Url::parse("http://127.0.0.1:9/seg0.ts").unwrap(),
        byte_range: None,
    };
    let err = loader().fetch_segment(&request).await.unwrap_err();
    assert!(matches!(err, FetchError::Network { .. } | FetchError::Timeout { .. }));
}

// =============================================================================
// Manifest loading
// =============================================================================

#[tokio::test]
async fn test_parser_loads_master_and_variant() {
    let server = MockServer::start().await;
    mount_text(&server, "/show/master.m3u8", MASTER).await;
    mount_text(&server, "/show/240p/index.m3u8", SHORT_MEDIA).await;

    let parser = HlsParser::new(loader());
    let manifest = parser.load(&url(&server, "/show/master.m3u8")).await.unwrap();
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.levels()[0].label, "240p");

    let level = &manifest.levels()[0];
    let playlist = parser.load_variant(&level.uri, level.index).await.unwrap();
    assert_eq!(playlist.segments.len(), 3);
    assert_eq!(
        playlist.segments[1].uri.as_str(),
        format!("{}/show/240p/seg1.ts", server.uri())
    );
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn test_session_plays_to_end() {
    let server = MockServer::start().await;
    mount_text(&server, "/vod/master.m3u8", MASTER).await;
    mount_text(&server, "/vod/240p/index.m3u8", SHORT_MEDIA).await;
    mount_text(&server, "/vod/360p/index.m3u8", SHORT_MEDIA).await;
    for variant in ["240p", "360p"] {
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(format!(r"^/vod/{}/seg\d\.ts$", variant)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;
    }

    let config = PlayerConfig {
        autoplay: true,
        tick_interval_ms: 50,
        ..Default::default()
    };
    let session = PlayerSession::new(
        config,
        loader(),
        Arc::new(HeadlessPlatform::default()),
        Arc::new(MemoryResumeStore::new()),
    );
    let handle = session.handle();
    let mut events = handle.subscribe();
    let stop = CancellationToken::new();
    let driver = tokio::spawn(session.run_until(stop.clone()));

    let attach = handle
        .attach(AttachRequest::new(url(&server, "/vod/master.m3u8")))
        .await
        .unwrap();

    let seen = tokio::time::timeout(
        Duration::from_secs(10),
        wait_for_state(&mut events, PlaybackState::Ended),
    )
    .await
    .expect("playback should reach the end");
    assert_eq!(seen[0], PlaybackState::Attaching);
    assert!(seen.contains(&PlaybackState::Playing));
    assert_eq!(handle.stats().attach, Some(attach));

    handle.detach().await.unwrap();
    let detached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Notification::Detached { attach: id }) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(detached, attach);

    stop.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_session_rejects_missing_manifest() {
    let server = MockServer::start().await;
    let session = PlayerSession::new(
        PlayerConfig::default(),
        loader(),
        Arc::new(HeadlessPlatform::default()),
        Arc::new(MemoryResumeStore::new()),
    );
    let handle = session.handle();
    let mut events = handle.subscribe();
    let stop = CancellationToken::new();
    let driver = tokio::spawn(session.run_until(stop.clone()));

    handle
        .attach(AttachRequest::new(url(&server, "/missing.m3u8")))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        Notification::Error { fatal: false, .. }
    ));
    assert_eq!(handle.stats().state, PlaybackState::Idle);

    stop.cancel();
    driver.await.unwrap();
    assert!(handle.play().is_err());
}
