use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vu_loadtest::checks::{parse_check_list, Check};
use vu_loadtest::client::{build_client, ClientConfig};
use vu_loadtest::errors::ErrorCategory;
use vu_loadtest::executor::RequestExecutor;
use vu_loadtest::outcome::CheckStatus;
use vu_loadtest::target::Endpoint;

fn executor(url: &str, checks: Vec<Check>) -> RequestExecutor {
    RequestExecutor::new(reqwest::Client::new(), Endpoint::parse(url).unwrap(), checks)
}

#[tokio::test]
async fn body_and_header_checks_pass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Request-Id", "abc123")
                .set_body_string(r#"{"status":"ok","version":"1.4.2"}"#),
        )
        .mount(&server)
        .await;

    let checks = parse_check_list(
        r#"status == 200; body contains "ok"; body matches "\d+\.\d+\.\d+"; header X-Request-Id"#,
    )
    .unwrap();
    let outcome = executor(&format!("{}/api", server.uri()), checks)
        .execute(0, 0)
        .await;

    assert_eq!(outcome.status_code, Some(200));
    assert_eq!(outcome.checks.len(), 4);
    assert!(
        outcome.checks.iter().all(|c| c.passed),
        "checks: {:?}",
        outcome.checks
    );
    assert_eq!(outcome.check_result, CheckStatus::Pass);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn one_failing_check_fails_the_iteration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let checks = vec![
        Check::parse("status == 200").unwrap(),
        Check::named("has payload", "body contains \"items\"").unwrap(),
    ];
    let outcome = executor(&server.uri(), checks).execute(3, 9).await;

    assert_eq!(outcome.vu_id, 3);
    assert_eq!(outcome.iteration, 9);
    assert_eq!(outcome.check_result, CheckStatus::Fail);
    let failed: Vec<_> = outcome.checks.iter().filter(|c| !c.passed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "has payload");
    assert_eq!(failed[0].actual, "maintenance");
}

#[tokio::test]
async fn latency_check_against_slow_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
        .mount(&server)
        .await;

    let checks = vec![Check::parse("latency < 50ms").unwrap()];
    let outcome = executor(&server.uri(), checks).execute(0, 0).await;

    assert!(outcome.latency >= Duration::from_millis(150));
    assert_eq!(outcome.check_result, CheckStatus::Fail);
}

#[tokio::test]
async fn timeout_is_categorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = build_client(&ClientConfig {
        request_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    })
    .unwrap()
    .client;
    let outcome = RequestExecutor::new(client, Endpoint::parse(&server.uri()).unwrap(), Vec::new())
        .execute(0, 0)
        .await;

    assert_eq!(outcome.check_result, CheckStatus::Error);
    assert_eq!(
        outcome.error.map(|e| e.category),
        Some(ErrorCategory::TimeoutError)
    );
}

#[tokio::test]
async fn custom_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-env", "staging"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = build_client(&ClientConfig {
        custom_headers: Some("X-Env:staging".to_string()),
        ..ClientConfig::default()
    })
    .unwrap()
    .client;
    let outcome = RequestExecutor::new(client, Endpoint::parse(&server.uri()).unwrap(), Vec::new())
        .execute(0, 0)
        .await;

    assert_eq!(outcome.status_code, Some(204));
    assert_eq!(outcome.check_result, CheckStatus::Pass);
}
