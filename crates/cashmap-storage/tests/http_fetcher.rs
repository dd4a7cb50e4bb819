use std::time::Duration;

use cashmap_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RequestIdentity};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        ..HttpClientConfig::default()
    })
    .expect("fetcher")
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/category/101"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/category/101"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<ul></ul>"))
        .mount(&server)
        .await;

    let fetcher = fast_fetcher();
    let url = format!("{}/category/101", server.uri());
    let resp = fetcher
        .fetch_bytes(Uuid::new_v4(), "chobirich", &url)
        .await
        .expect("second attempt succeeds");
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.text(), "<ul></ul>");
}

#[tokio::test]
async fn forbidden_is_blocked_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/category/101"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fast_fetcher();
    let url = format!("{}/category/101", server.uri());
    let err = fetcher
        .fetch_bytes(Uuid::new_v4(), "chobirich", &url)
        .await
        .expect_err("403 must fail");
    assert!(matches!(err, FetchError::Blocked { status: 403, .. }));
}

#[tokio::test]
async fn not_found_is_a_plain_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fast_fetcher();
    let err = fetcher
        .fetch_bytes(Uuid::new_v4(), "moppy", &format!("{}/missing", server.uri()))
        .await
        .expect_err("404 must fail");
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
}

#[tokio::test]
async fn device_identity_sets_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .and(header("user-agent", "cashmap-test-iphone"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ios view"))
        .mount(&server)
        .await;

    let fetcher = fast_fetcher();
    let identity = RequestIdentity::with_user_agent("cashmap-test-iphone");
    let resp = fetcher
        .fetch_with_identity(
            Uuid::new_v4(),
            "pointincome",
            &format!("{}/list", server.uri()),
            &identity,
        )
        .await
        .expect("identity header matches");
    assert_eq!(resp.text(), "ios view");
}

#[tokio::test]
async fn persistent_throttling_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/category/202"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .expect(3)
        .mount(&server)
        .await;

    let fetcher = fast_fetcher();
    let err = fetcher
        .fetch_bytes(
            Uuid::new_v4(),
            "moppy",
            &format!("{}/category/202", server.uri()),
        )
        .await
        .expect_err("throttled every time");
    assert!(matches!(err, FetchError::HttpStatus { status: 429, .. }));
}

#[tokio::test]
async fn busy_source_does_not_starve_other_sources() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moppy/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/chobirich/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
        .mount(&server)
        .await;

    let fetcher = std::sync::Arc::new(
        HttpFetcher::new(HttpClientConfig {
            global_concurrency: 2,
            per_source_concurrency: 1,
            ..HttpClientConfig::default()
        })
        .expect("fetcher"),
    );
    let run_id = Uuid::new_v4();
    let slow_url = format!("{}/moppy/list", server.uri());
    let slow = (0..2)
        .map(|_| {
            let fetcher = fetcher.clone();
            let url = slow_url.clone();
            tokio::spawn(async move { fetcher.fetch_bytes(run_id, "moppy", &url).await })
        })
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let resp = fetcher
        .fetch_bytes(run_id, "chobirich", &format!("{}/chobirich/list", server.uri()))
        .await
        .expect("fast source");
    assert_eq!(resp.text(), "fast");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "waited {:?} behind another source",
        started.elapsed()
    );

    for handle in slow {
        assert_eq!(handle.await.unwrap().unwrap().text(), "slow");
    }
}
