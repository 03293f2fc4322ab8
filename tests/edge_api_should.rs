use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use serde_json::Value;
use streamgate::AppConfig;
use streamgate::models::{Channel, ChannelCatalog, ChannelCategory};
use streamgate::server::EdgeApplicationServer;
use streamgate::server::error::{FetchError, GuideError};
use streamgate::server::services::catalog_services::MockCatalogServiceTrait;
use streamgate::server::services::edge_services::EdgeServices;
use streamgate::server::services::epg_services::MockGuideServiceTrait;
use streamgate::server::services::snapshot_services::SnapshotCache;
use streamgate::server::services::transport_services::MockHttpTransport;
use streamgate::server::utils::xmltv_utils::parse_guide;
use tower::ServiceExt;

const GUIDE: &str = r#"<tv>
  <programme channel="tvnz.1" start="20240728060000 +1200" stop="20240728070000 +1200"><title>Breakfast</title></programme>
  <programme channel="tvnz.1" start="20240728070000 +1200" stop="20240728080000 +1200"><title>Morning</title></programme>
</tv>"#;

fn catalog() -> ChannelCatalog {
    ChannelCatalog {
        channels: vec![Channel {
            id: "tvnz-1".to_string(),
            name: "TVNZ 1".to_string(),
            logo_url: "https://img.example/t1.png".to_string(),
            stream_url: "https://cdn.example/t1.m3u8".to_string(),
            epg_id: "tvnz.1".to_string(),
            category: ChannelCategory::NewZealand,
            request_headers: None,
            needs_proxy: false,
        }],
        diagnostic: None,
    }
}

fn services(
    catalog: MockCatalogServiceTrait,
    guide: MockGuideServiceTrait,
) -> EdgeServices {
    let mut services = EdgeServices::with_transport(
        Arc::new(AppConfig::default()),
        Arc::new(MockHttpTransport::new()),
    );
    services.catalog = Arc::new(catalog);
    services.guide = Arc::new(guide);
    services
}

fn healthy_services() -> EdgeServices {
    let mut catalog_service = MockCatalogServiceTrait::new();
    catalog_service
        .expect_get_channels()
        .returning(|| Ok(catalog()));
    let mut guide_service = MockGuideServiceTrait::new();
    guide_service
        .expect_fetch_guide()
        .returning(|| parse_guide(GUIDE));
    services(catalog_service, guide_service)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("valid request"),
        )
        .await
        .expect("router is infallible");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn list_channels_in_camel_case() {
    let app = EdgeApplicationServer::router(healthy_services());

    let (status, body) = get_json(app, "/api/v1/channels").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channels"][0]["name"], "TVNZ 1");
    assert_eq!(body["channels"][0]["streamUrl"], "https://cdn.example/t1.m3u8");
    assert_eq!(body["channels"][0]["needsProxy"], false);
    assert!(body.get("diagnostic").is_none());
}

#[tokio::test]
async fn find_one_channel_or_404() {
    let services = healthy_services();

    let (status, body) = get_json(
        EdgeApplicationServer::router(services.clone()),
        "/api/v1/channels/tvnz-1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["epgId"], "tvnz.1");

    let (status, _) = get_json(
        EdgeApplicationServer::router(services),
        "/api/v1/channels/nope",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn serve_a_channel_guide_window() {
    let app = EdgeApplicationServer::router(healthy_services());

    let (status, body) = get_json(
        app,
        "/api/v1/guide/tvnz.1?from=2024-07-27T19:30:00Z&to=2024-07-27T21:00:00Z",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["epgId"], "tvnz.1");
    let programmes = body["programmes"].as_array().expect("array");
    assert_eq!(programmes.len(), 1);
    assert_eq!(programmes[0]["title"], "Morning");
}

#[tokio::test]
async fn reject_bad_guide_windows() {
    let services = healthy_services();

    let (status, _) = get_json(
        EdgeApplicationServer::router(services.clone()),
        "/api/v1/guide/tvnz.1?from=yesterday",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(
        EdgeApplicationServer::router(services),
        "/api/v1/guide/tvnz.1?from=2024-07-28T00:00:00Z&to=2024-07-27T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn return_an_empty_guide_for_unknown_channels() {
    let app = EdgeApplicationServer::router(healthy_services());

    let (status, body) = get_json(app, "/api/v1/guide/unknown").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["programmes"], Value::Array(Vec::new()));
    assert_eq!(body["now"], Value::Null);
}

#[tokio::test]
async fn surface_fetch_failures_as_bad_gateway() {
    let mut catalog_service = MockCatalogServiceTrait::new();
    catalog_service.expect_get_channels().returning(|| {
        Err(FetchError::AllFailed {
            last_proxy: "relay timed out".to_string(),
            direct: "dns error".to_string(),
        })
    });
    let mut guide_service = MockGuideServiceTrait::new();
    guide_service
        .expect_fetch_guide()
        .returning(|| Err(GuideError::Malformed("XML error at byte 3".to_string())));
    let services = services(catalog_service, guide_service);

    let (status, _) = get_json(
        EdgeApplicationServer::router(services.clone()),
        "/api/v1/channels",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (status, _) = get_json(EdgeApplicationServer::router(services), "/api/v1/guide").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn fetch_the_catalog_once_per_snapshot() {
    let mut catalog_service = MockCatalogServiceTrait::new();
    catalog_service
        .expect_get_channels()
        .times(1)
        .returning(|| Ok(catalog()));
    let services = services(catalog_service, MockGuideServiceTrait::new());

    for _ in 0..3 {
        let (status, _) = get_json(
            EdgeApplicationServer::router(services.clone()),
            "/api/v1/channels",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn report_health_with_snapshot_state() {
    let services = healthy_services();

    let (status, body) = get_json(EdgeApplicationServer::router(services.clone()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["environment"], "development");
    assert_eq!(body["catalog"]["loaded"], false);

    services.current_channels().await.expect("catalog loads");
    services.current_guide().await.expect("guide loads");

    let (_, body) = get_json(EdgeApplicationServer::router(services), "/health").await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["guide"]["loaded"], true);
}

#[tokio::test]
async fn rebuild_a_snapshot_after_its_ttl() {
    let cache: SnapshotCache<usize> = SnapshotCache::new(Duration::from_millis(20));
    let builds = AtomicUsize::new(0);
    let build = || async { Ok::<usize, ()>(builds.fetch_add(1, Ordering::SeqCst) + 1) };

    assert_eq!(*cache.get_or_refresh(build).await.expect("builds"), 1);
    assert_eq!(*cache.get_or_refresh(build).await.expect("cached"), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(*cache.get_or_refresh(build).await.expect("rebuilt"), 2);
}

#[tokio::test]
async fn keep_the_previous_snapshot_when_a_refresh_fails() {
    let cache: SnapshotCache<&'static str> = SnapshotCache::new(Duration::ZERO);

    cache
        .get_or_refresh(|| async { Ok::<_, String>("first") })
        .await
        .expect("first build");
    let err = cache
        .get_or_refresh(|| async { Err::<&'static str, _>("upstream down".to_string()) })
        .await
        .expect_err("refresh fails");

    assert_eq!(err, "upstream down");
    assert!(cache.age().await.is_some());
}
