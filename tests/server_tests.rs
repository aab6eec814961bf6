use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use resolver_scan_rs::config::ScanConfig;
use resolver_scan_rs::prober::Probe;
use resolver_scan_rs::ranges::RangeList;
use resolver_scan_rs::server::{router, ControlReply, ErrorReply, ShuffleReply};
use resolver_scan_rs::session::Session;
use resolver_scan_rs::types::{ProbeResult, RankedEntry, ScanStatus, SessionState};
use tower::ServiceExt;

struct SlowProbe;

#[async_trait]
impl Probe for SlowProbe {
    async fn probe(&self, address: Ipv4Addr) -> ProbeResult {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ProbeResult::responsive(address, Duration::from_millis(3))
    }
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn control_endpoints_drive_the_session() {
    let mut cfg = ScanConfig::new("t.example.com");
    cfg.concurrency = 2;
    cfg.batch_size = 4;
    let session = Session::new(cfg, RangeList::parse("10.5.0.0/24"), Arc::new(SlowProbe));
    let app = router(session.handle());
    let run = tokio::spawn(session.run());

    let resp = app.clone().oneshot(request("GET", "/api/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status: ScanStatus = json(resp).await;
    assert_eq!(status.total, 254);
    assert_eq!(status.state, SessionState::Running);

    let resp = app.clone().oneshot(request("POST", "/api/shuffle")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: ErrorReply = json(resp).await;
    assert!(err.error.contains("paused"));

    let resp = app.clone().oneshot(request("POST", "/api/pause")).await.unwrap();
    let reply: ControlReply = json(resp).await;
    assert_eq!(
        reply,
        ControlReply {
            paused: true,
            changed: true
        }
    );

    // Let a drain that was already running when the gate closed finish.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let resp = app.clone().oneshot(request("GET", "/api/status")).await.unwrap();
    let status: ScanStatus = json(resp).await;
    assert_eq!(status.state, SessionState::Paused);

    let resp = app.clone().oneshot(request("POST", "/api/shuffle")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let shuffled: ShuffleReply = json(resp).await;
    assert!(shuffled.remaining <= 254);

    let resp = app.clone().oneshot(request("GET", "/api/results")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ranked: Vec<RankedEntry> = json(resp).await;
    assert_eq!(shuffled.remaining + ranked.len(), 254);

    let resp = app.clone().oneshot(request("POST", "/api/resume")).await.unwrap();
    let reply: ControlReply = json(resp).await;
    assert!(!reply.paused);
    assert!(reply.changed);

    let resp = app.clone().oneshot(request("POST", "/api/stop")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    run.await.unwrap().expect("run");

    let resp = app.clone().oneshot(request("GET", "/api/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GONE);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let session = Session::new(
        ScanConfig::new("t.example.com"),
        RangeList::parse("10.6.0.0/30"),
        Arc::new(SlowProbe),
    );
    let app = router(session.handle());
    let resp = app.oneshot(request("GET", "/api/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
