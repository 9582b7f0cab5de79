//! Gateway integration tests
//!
//! Drive the router with `tower::ServiceExt::oneshot` against mocked
//! upstreams (wiremock) and a fake remux pipeline writing to a tempdir.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use ottarr_api::{create_router, serve, AppState};
use ottarr_core::config::DeliveryMode;
use ottarr_core::{Schedule, ScheduleStore, ScheduledProgram, VirtualChannel};
use ottarr_livestream::livestream::{DeliveryHandle, DeliveryPipeline, Termination};
use ottarr_livestream::{
    ChannelSupervisor, HlsLayout, PassthroughPipeline, StreamResult, SupervisorConfig,
    UpstreamClient, UpstreamSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TS_PACKET_SIZE: usize = 188;

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        idle_timeout: Duration::from_secs(300),
        monitor_interval: Duration::from_secs(3600),
        startup_timeout: Duration::from_secs(5),
        termination_grace: Duration::from_secs(1),
    }
}

/// "nba" and "sky sports" air `source_url` now; "later" has nothing on air yet
fn schedule(source_url: &str) -> Schedule {
    let now = Utc::now();
    let program = |start, stop, url: &str| ScheduledProgram {
        start,
        stop,
        source_url: url.to_string(),
        name: "Lakers vs Celtics".to_string(),
        description: String::new(),
        icon_url: None,
    };
    Schedule::new([
        VirtualChannel {
            id: "nba".to_string(),
            name: "NBA".to_string(),
            icon_url: None,
            category: None,
            programs: vec![program(
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
                source_url,
            )],
        },
        VirtualChannel {
            id: "sky sports".to_string(),
            name: "Sky Sports".to_string(),
            icon_url: None,
            category: None,
            programs: vec![program(
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
                source_url,
            )],
        },
        VirtualChannel {
            id: "later".to_string(),
            name: "Later".to_string(),
            icon_url: None,
            category: None,
            programs: vec![program(
                now + ChronoDuration::hours(4),
                now + ChronoDuration::hours(5),
                source_url,
            )],
        },
    ])
}

fn app_state(
    schedule: Schedule,
    pipeline: Arc<dyn DeliveryPipeline>,
    hls: Option<HlsLayout>,
) -> AppState {
    let schedule = Arc::new(ScheduleStore::from_schedule(schedule));
    let supervisor = Arc::new(ChannelSupervisor::new(
        Arc::clone(&schedule),
        pipeline,
        test_config(),
    ));
    let upstream = UpstreamClient::new(UpstreamSettings {
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
        touch_interval: Duration::from_secs(1),
        user_agent: "ottarr-test".to_string(),
    })
    .unwrap();
    AppState {
        schedule,
        supervisor,
        upstream,
        hls,
    }
}

fn passthrough_app(source_url: &str) -> (AppState, Router) {
    let state = app_state(schedule(source_url), Arc::new(PassthroughPipeline), None);
    let router = create_router(state.clone());
    (state, router)
}

fn ts_packets(count: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * TS_PACKET_SIZE);
    for i in 0..count {
        let mut packet = vec![i as u8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        data.extend(packet);
    }
    data
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::post(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_to_string(response: axum::response::Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_passthrough_drops_garbage_prefix() {
    let upstream = MockServer::start().await;
    let mut body = vec![0xAB; 37];
    body.extend(ts_packets(5));
    Mock::given(method("GET"))
        .and(path("/live/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&upstream)
        .await;

    let (_, router) = passthrough_app(&format!("{}/live/a.ts", upstream.uri()));
    let response = get(&router, "/stream/nba.ts").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "none");
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let data = body_bytes(response).await;
    assert_eq!(data.len(), 5 * TS_PACKET_SIZE);
    assert!(data.chunks(TS_PACKET_SIZE).all(|p| p[0] == 0x47));
    assert_eq!(data, ts_packets(5));
}

#[tokio::test]
async fn test_range_request_mirrors_partial_content() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/a.ts"))
        .and(header_matcher("range", "bytes=1000-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 1000-4999/5000")
                .insert_header("accept-ranges", "bytes")
                .insert_header("content-type", "video/mp2t")
                .set_body_bytes(vec![0x11; 4000]),
        )
        .mount(&upstream)
        .await;

    let (_, router) = passthrough_app(&format!("{}/live/a.ts", upstream.uri()));
    let response = router
        .clone()
        .oneshot(
            Request::get("/stream/nba")
                .header(header::RANGE, "bytes=1000-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 1000-4999/5000");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4000");
    // ranged bodies are forwarded untouched
    assert_eq!(body_bytes(response).await, vec![0x11; 4000]);
}

#[tokio::test]
async fn test_range_ignored_upstream_falls_back_to_aligned_stream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_packets(2)))
        .mount(&upstream)
        .await;

    let (_, router) = passthrough_app(&format!("{}/live/a.ts", upstream.uri()));
    let response = router
        .clone()
        .oneshot(
            Request::get("/stream/nba.ts")
                .header(header::RANGE, "bytes=0-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "none");
    assert_eq!(body_bytes(response).await.len(), 2 * TS_PACKET_SIZE);
}

#[tokio::test]
async fn test_unknown_channel_and_off_air_are_not_found() {
    let (_, router) = passthrough_app("http://127.0.0.1:9/unused.ts");

    let response = get(&router, "/stream/nhl.ts").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_to_string(response).await, "Channel not found");

    // off air: the body names what is on next
    let response = get(&router, "/stream/later").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_to_string(response)
        .await
        .starts_with("No program currently scheduled; next: Lakers vs Celtics at "));
}

#[tokio::test]
async fn test_upstream_error_is_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let source = format!("{}/live/a.ts", upstream.uri());
    let (state, router) = passthrough_app(&source);
    let response = get(&router, "/stream/nba.ts").await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let text = body_to_string(response).await;
    assert!(!text.contains(&source));

    // the failed transfer released its viewer slot
    let session = state.supervisor.session("nba").unwrap();
    assert_eq!(session.viewers(), 0);
}

#[tokio::test]
async fn test_status_stop_and_health() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_packets(1)))
        .mount(&upstream)
        .await;

    let (_, router) = passthrough_app(&format!("{}/live/a.ts", upstream.uri()));
    let response = get(&router, "/stream/nba.ts").await;
    assert_eq!(response.status(), StatusCode::OK);
    body_bytes(response).await;

    let response = get(&router, "/streams/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    let status: serde_json::Value = serde_json::from_str(&body_to_string(response).await).unwrap();
    assert_eq!(status["nba"]["state"], "running");
    assert_eq!(status["nba"]["program_name"], "Lakers vs Celtics");

    let response = get(&router, "/health").await;
    let health: serde_json::Value = serde_json::from_str(&body_to_string(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["total_channels"], 3);
    assert_eq!(health["active_sessions"], 1);
    assert_eq!(health["next_program"]["channel_id"], "later");
    assert_eq!(health["next_program"]["name"], "Lakers vs Celtics");

    let response = post(&router, "/streams/stop/nba").await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = post(&router, "/streams/stop/nba").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&router, "/streams/status").await;
    assert_eq!(body_to_string(response).await, "{}");
}

#[tokio::test]
async fn test_schedule_reload_on_static_store() {
    let (_, router) = passthrough_app("http://127.0.0.1:9/unused.ts");
    let response = post(&router, "/schedule/reload").await;
    assert_eq!(response.status(), StatusCode::OK);
    let reload: serde_json::Value = serde_json::from_str(&body_to_string(response).await).unwrap();
    assert_eq!(reload["channels"], 3);
}

/// Writes a one-segment playlist for the channel, like a remuxer would
struct FakeRemux {
    layout: HlsLayout,
    start_delay: Duration,
}

struct ReadyHandle;

#[async_trait]
impl DeliveryHandle for ReadyHandle {
    async fn wait_ready(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn poll_exit(&mut self) -> StreamResult<Option<String>> {
        Ok(None)
    }

    async fn terminate(&mut self, _grace: Duration) -> StreamResult<Termination> {
        Ok(Termination::Graceful)
    }
}

#[async_trait]
impl DeliveryPipeline for FakeRemux {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Remux
    }

    async fn start(
        &self,
        channel_id: &str,
        _source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        tokio::time::sleep(self.start_delay).await;
        let dir = self.layout.channel_dir(channel_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("seg_00000.ts"), ts_packets(3)).await?;
        tokio::fs::write(
            self.layout.manifest_path(channel_id),
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.000000,\nseg_00000.ts\n",
        )
        .await?;
        Ok(Box::new(ReadyHandle))
    }

    async fn switch_source(
        &self,
        channel_id: &str,
        _current: Box<dyn DeliveryHandle>,
        source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        self.start(channel_id, source_url).await
    }
}

fn remux_app(output: &std::path::Path, start_delay: Duration) -> Router {
    let layout = HlsLayout::new(output);
    let pipeline = Arc::new(FakeRemux {
        layout: layout.clone(),
        start_delay,
    });
    create_router(app_state(
        schedule("http://upstream.test/a.ts"),
        pipeline,
        Some(layout),
    ))
}

#[tokio::test]
async fn test_remux_playlist_and_segments() {
    let output = tempfile::tempdir().unwrap();
    let router = remux_app(output.path(), Duration::ZERO);

    let response = get(&router, "/stream/nba.m3u8").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    let playlist = body_to_string(response).await;
    assert!(playlist.lines().any(|line| line == "nba/seg_00000.ts"));

    let response = get(&router, "/stream/nba/seg_00000.ts").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, ts_packets(3));

    let response = get(&router, "/stream/nba/seg_99999.ts").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // only media segments are served
    let response = get(&router, "/stream/nba/index.m3u8").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = get(&router, "/stream/nba/..%2Findex.m3u8").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remux_playlist_escapes_channel_id() {
    let output = tempfile::tempdir().unwrap();
    let router = remux_app(output.path(), Duration::ZERO);

    let response = get(&router, "/stream/sky%20sports.m3u8").await;
    assert_eq!(response.status(), StatusCode::OK);
    let playlist = body_to_string(response).await;
    assert!(playlist.lines().any(|line| line == "sky%20sports/seg_00000.ts"));

    let response = get(&router, "/stream/sky%20sports/seg_00000.ts").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, ts_packets(3));
}

#[tokio::test]
async fn test_segment_without_session_is_not_found() {
    let output = tempfile::tempdir().unwrap();
    let router = remux_app(output.path(), Duration::ZERO);

    let response = get(&router, "/stream/nba/seg_00000.ts").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_playlist_while_starting_is_service_unavailable() {
    let output = tempfile::tempdir().unwrap();
    let router = remux_app(output.path(), Duration::from_millis(500));

    let first = tokio::spawn({
        let router = router.clone();
        async move { get(&router, "/stream/nba.m3u8").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = get(&router, "/stream/nba.m3u8").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let response = first.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Upstream that sends a few packets and then keeps every connection open
async fn endless_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: video/mp2t\r\n\r\n")
                .await;
            let _ = socket.write_all(&ts_packets(4)).await;
            open.push(socket);
        }
    });
    format!("http://{addr}/live/a.ts")
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let source = endless_upstream().await;
    let mut state = app_state(schedule(&source), Arc::new(PassthroughPipeline), None);
    // the relay would otherwise wait this long on the silent upstream
    state.upstream = UpstreamClient::new(UpstreamSettings {
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(300),
        touch_interval: Duration::from_secs(1),
        user_agent: "ottarr-test".to_string(),
    })
    .unwrap();
    let supervisor = Arc::clone(&state.supervisor);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    let mut viewer = tokio::net::TcpStream::connect(addr).await.unwrap();
    viewer
        .write_all(b"GET /stream/nba.ts HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !String::from_utf8_lossy(&received).contains("\r\n\r\n") {
        let n = viewer.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the response started");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&received).starts_with("HTTP/1.1 200"));
    assert_eq!(supervisor.active_count(), 1);

    stop_tx.send(()).unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server kept waiting on the open stream");
    served.unwrap().unwrap();

    assert!(supervisor.status().is_empty());
    // the viewer connection is closed once its body ends
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match viewer.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
