use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use streamgate::server::error::{FetchError, TransportError};
use streamgate::server::services::fetch_services::{
    Candidate, FetchOptions, ResilientFetcher, candidates,
};
use streamgate::server::services::transport_services::{
    HttpTransport, MockHttpTransport, UpstreamResponse,
};

const TARGET: &str = "https://origin.example/data.json";

fn ok(body: &'static str) -> Result<UpstreamResponse, TransportError> {
    Ok(UpstreamResponse::from_bytes(
        StatusCode::OK,
        HeaderMap::new(),
        body,
    ))
}

fn status(code: StatusCode) -> Result<UpstreamResponse, TransportError> {
    Ok(UpstreamResponse::from_bytes(code, HeaderMap::new(), "nope"))
}

fn proxies() -> Vec<String> {
    vec![
        "https://relay-one.example/?url=".to_string(),
        "https://relay-two.example/".to_string(),
    ]
}

#[test]
fn list_every_proxy_in_order_then_direct() {
    assert_eq!(
        candidates(&proxies()),
        vec![
            Candidate::Proxy("https://relay-one.example/?url=".to_string()),
            Candidate::Proxy("https://relay-two.example/".to_string()),
            Candidate::Direct,
        ]
    );
    assert_eq!(candidates(&[]), vec![Candidate::Direct]);
}

#[test]
fn encode_the_target_only_for_query_style_prefixes() {
    let query = Candidate::Proxy("https://relay-one.example/?url=".to_string());
    let path = Candidate::Proxy("https://relay-two.example/".to_string());

    assert_eq!(
        query.url_for(TARGET),
        "https://relay-one.example/?url=https%3A%2F%2Forigin.example%2Fdata.json"
    );
    assert_eq!(
        path.url_for(TARGET),
        "https://relay-two.example/https://origin.example/data.json"
    );
    assert_eq!(Candidate::Direct.url_for(TARGET), TARGET);
}

#[tokio::test]
async fn stop_at_the_first_candidate_that_succeeds() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-one.example/"))
        .times(1)
        .returning(|_, _, _| Err(TransportError("connection refused".to_string())));
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-two.example/"))
        .times(1)
        .returning(|_, _, _| ok("from relay two"));
    transport
        .expect_send()
        .withf(|_, url, _| url == TARGET)
        .never();

    let fetcher = ResilientFetcher::new(Arc::new(transport), proxies());
    let response = fetcher
        .fetch(TARGET, &FetchOptions::default())
        .await
        .expect("second relay should answer");

    assert_eq!(
        response.via,
        Candidate::Proxy("https://relay-two.example/".to_string())
    );
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "from relay two");
}

#[tokio::test]
async fn treat_a_non_success_status_like_a_failed_connection() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-one.example/"))
        .times(1)
        .returning(|_, _, _| status(StatusCode::TOO_MANY_REQUESTS));
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-two.example/"))
        .times(1)
        .returning(|_, _, _| status(StatusCode::FORBIDDEN));
    transport
        .expect_send()
        .withf(|_, url, _| url == TARGET)
        .times(1)
        .returning(|_, _, _| ok("direct"));

    let fetcher = ResilientFetcher::new(Arc::new(transport), proxies());
    let response = fetcher
        .fetch(TARGET, &FetchOptions::default())
        .await
        .expect("direct should answer");

    assert_eq!(response.via, Candidate::Direct);
    assert_eq!(response.text(), "direct");
}

#[tokio::test]
async fn name_the_last_proxy_and_direct_failures_when_everything_fails() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-one.example/"))
        .returning(|_, _, _| status(StatusCode::SERVICE_UNAVAILABLE));
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-two.example/"))
        .returning(|_, _, _| Err(TransportError("connection reset".to_string())));
    transport
        .expect_send()
        .withf(|_, url, _| url == TARGET)
        .returning(|_, _, _| status(StatusCode::NOT_FOUND));

    let fetcher = ResilientFetcher::new(Arc::new(transport), proxies());
    let err = fetcher
        .fetch(TARGET, &FetchOptions::default())
        .await
        .expect_err("every candidate fails");

    assert!(matches!(err, FetchError::AllFailed { .. }));
    let message = err.to_string();
    assert!(message.contains("connection reset"), "{}", message);
    assert!(message.contains("returned HTTP 404"), "{}", message);
    // only the last proxy is named, not every intermediate one
    assert!(!message.contains("503"), "{}", message);
}

#[tokio::test]
async fn go_straight_to_direct_without_proxies() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|_, url, _| url == TARGET)
        .times(1)
        .returning(|_, _, _| Err(TransportError("dns error".to_string())));

    let fetcher = ResilientFetcher::new(Arc::new(transport), Vec::new());
    let err = fetcher
        .fetch(TARGET, &FetchOptions::default())
        .await
        .expect_err("direct fails");

    let message = err.to_string();
    assert!(message.contains("no proxies configured"), "{}", message);
    assert!(message.contains("dns error"), "{}", message);
}

#[tokio::test]
async fn restart_from_the_first_candidate_on_every_call() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-one.example/"))
        .times(2)
        .returning(|_, _, _| status(StatusCode::BAD_GATEWAY));
    transport
        .expect_send()
        .withf(|_, url, _| url.starts_with("https://relay-two.example/"))
        .times(2)
        .returning(|_, _, _| ok("two"));

    let fetcher = ResilientFetcher::new(Arc::new(transport), proxies());
    for _ in 0..2 {
        let response = fetcher
            .fetch(TARGET, &FetchOptions::default())
            .await
            .expect("relay two answers");
        assert_eq!(response.text(), "two");
    }
}

#[tokio::test]
async fn pass_method_and_headers_through() {
    let mut transport = MockHttpTransport::new();
    transport
        .expect_send()
        .withf(|method, url, headers| {
            *method == Method::HEAD
                && url == TARGET
                && headers.get("x-test").is_some_and(|v| v == "1")
        })
        .times(1)
        .returning(|_, _, _| ok(""));

    let mut headers = HeaderMap::new();
    headers.insert("x-test", "1".parse().expect("static header"));
    let options = FetchOptions {
        method: Method::HEAD,
        ..FetchOptions::default()
    }
    .with_headers(headers);

    let fetcher = ResilientFetcher::new(Arc::new(transport), Vec::new());
    fetcher.fetch(TARGET, &options).await.expect("direct ok");
}

/// proxies hang past the deadline, direct answers straight away
struct SlowRelayTransport {
    delay: Duration,
}

#[async_trait]
impl HttpTransport for SlowRelayTransport {
    async fn send(
        &self,
        _method: Method,
        url: &str,
        _headers: HeaderMap,
    ) -> Result<UpstreamResponse, TransportError> {
        if url != TARGET {
            tokio::time::sleep(self.delay).await;
        }
        ok("direct after timeouts")
    }
}

#[tokio::test]
async fn abandon_a_candidate_that_misses_its_deadline() {
    let transport = SlowRelayTransport {
        delay: Duration::from_secs(5),
    };
    let fetcher = ResilientFetcher::new(Arc::new(transport), proxies());

    let started = std::time::Instant::now();
    let response = fetcher
        .fetch(TARGET, &FetchOptions::default().with_timeout_ms(50))
        .await
        .expect("direct answers");

    assert_eq!(response.via, Candidate::Direct);
    assert_eq!(response.text(), "direct after timeouts");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn report_timeouts_in_the_aggregated_error() {
    struct AlwaysSlow;

    #[async_trait]
    impl HttpTransport for AlwaysSlow {
        async fn send(
            &self,
            _method: Method,
            _url: &str,
            _headers: HeaderMap,
        ) -> Result<UpstreamResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ok("too late")
        }
    }

    let fetcher = ResilientFetcher::new(Arc::new(AlwaysSlow), proxies());
    let err = fetcher
        .fetch(TARGET, &FetchOptions::default().with_timeout_ms(20))
        .await
        .expect_err("nothing answers in time");

    let message = err.to_string();
    assert!(message.contains("timed out after 20ms"), "{}", message);
    assert!(message.contains("relay-two.example"), "{}", message);
}
