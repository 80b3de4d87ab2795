//! End-to-end runs against wiremock stubs.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vu_loadtest::aggregator::MetricsAggregator;
use vu_loadtest::checks::Check;
use vu_loadtest::client::ClientConfig;
use vu_loadtest::config::{Config, SummaryFormat};
use vu_loadtest::engine::{exit_code, Engine};
use vu_loadtest::load_models::{LoadProfile, Stage};
use vu_loadtest::outcome::CheckStatus;
use vu_loadtest::scheduler::SchedulerConfig;
use vu_loadtest::target::Endpoint;
use vu_loadtest::vu::Pacing;

fn config_for(url: &str, profile: LoadProfile) -> Config {
    Config {
        endpoint: Endpoint::parse(url).unwrap(),
        profile,
        pacing: Pacing::None,
        checks: Vec::new(),
        failure_threshold: None,
        run_timeout: None,
        client: ClientConfig::default(),
        scheduler: SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            max_vus: None,
        },
        summary_interval: None,
        summary_format: SummaryFormat::Text,
        print_metrics: false,
    }
}

fn fixed(concurrency: usize, iterations: u64) -> LoadProfile {
    LoadProfile::Fixed {
        concurrency,
        iterations,
    }
}

fn stage(ms: u64, target: usize) -> Stage {
    Stage::new(Duration::from_millis(ms), target)
}

/// An address nothing is listening on.
fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/", port)
}

// --- Fixed mode ---

#[tokio::test]
async fn fixed_mode_runs_exactly_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1000)
        .mount(&server)
        .await;

    let config = config_for(&format!("{}/health", server.uri()), fixed(50, 1000));
    let aggregator = Arc::new(MetricsAggregator::with_retained_outcomes());
    let engine = Engine::with_aggregator(config, Arc::clone(&aggregator));

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.total_requests, 1000);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.peak_concurrency, 50);
    assert_eq!(summary.status_codes.get(&200), Some(&1000));

    let outcomes = aggregator.outcomes();
    assert_eq!(outcomes.len(), 1000);
    let unique: HashSet<(usize, u64)> = outcomes.iter().map(|o| (o.vu_id, o.iteration)).collect();
    assert_eq!(unique.len(), 1000, "every (vu_id, iteration) pair must be unique");
    assert!(outcomes.iter().all(|o| o.vu_id < 50));
}

#[tokio::test]
async fn fixed_mode_budget_smaller_than_population() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), fixed(10, 3));
    let summary = Engine::new(config).run().await.unwrap();

    assert_eq!(summary.total_requests, 3);
}

#[tokio::test]
async fn failed_status_check_is_recorded_and_run_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri(), fixed(2, 10));
    config.checks = vec![Check::parse("status == 200").unwrap()];
    let aggregator = Arc::new(MetricsAggregator::with_retained_outcomes());
    let engine = Engine::with_aggregator(config, Arc::clone(&aggregator));

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.total_requests, 10);
    assert_eq!(summary.check_failures, 10);
    assert_eq!(summary.failures, 10);
    assert_eq!(summary.network_errors, 0);
    assert_eq!(summary.status_codes.get(&500), Some(&10));

    let counts = summary.checks.get("status == 200").unwrap();
    assert_eq!(counts.passed, 0);
    assert_eq!(counts.failed, 10);

    assert!(aggregator
        .outcomes()
        .iter()
        .all(|o| o.check_result == CheckStatus::Fail && o.status_code == Some(500)));
}

#[tokio::test]
async fn server_error_without_checks_is_not_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = config_for(&server.uri(), fixed(1, 4));
    let summary = Engine::new(config).run().await.unwrap();

    assert_eq!(summary.total_requests, 4);
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.status_codes.get(&503), Some(&4));
    assert_eq!(summary.errors_by_category.get("server_error"), Some(&4));
}

#[tokio::test]
async fn network_errors_are_absorbed_into_the_summary() {
    let mut config = config_for(&closed_port_url(), fixed(1, 3));
    config.failure_threshold = Some(0.5);
    let aggregator = Arc::new(MetricsAggregator::with_retained_outcomes());
    let engine = Engine::with_aggregator(config, Arc::clone(&aggregator));

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.network_errors, 3);
    assert_eq!(summary.failures, 3);
    assert!((summary.failure_rate - 1.0).abs() < f64::EPSILON);
    assert_eq!(exit_code(&summary, Some(0.5)), 2);
    assert_eq!(exit_code(&summary, None), 0);

    for outcome in aggregator.outcomes() {
        assert_eq!(outcome.check_result, CheckStatus::Error);
        assert!(outcome.status_code.is_none());
        assert!(outcome.error.is_some());
    }
}

#[tokio::test]
async fn pacing_spaces_out_iterations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri(), fixed(1, 4));
    config.pacing = Pacing::Fixed(Duration::from_millis(100));

    let start = std::time::Instant::now();
    let summary = Engine::new(config).run().await.unwrap();

    assert_eq!(summary.total_requests, 4);
    // Four iterations, each followed by a 100ms wait except possibly the last.
    assert!(start.elapsed() >= Duration::from_millis(300));
}

// --- Staged mode ---

#[tokio::test]
async fn staged_concurrency_stays_within_stage_bounds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let stages = vec![stage(300, 4), stage(300, 8), stage(300, 0)];
    let profile = LoadProfile::Staged {
        stages: stages.clone(),
    };
    let mut config = config_for(&server.uri(), profile.clone());
    config.pacing = Pacing::Fixed(Duration::from_millis(10));

    let summary = Engine::new(config).run().await.unwrap();

    assert!(summary.total_requests > 0);
    assert!(summary.peak_concurrency <= 8);
    assert!(!summary.timeline.is_empty());

    for sample in &summary.timeline {
        let (a, b) = profile.bounds_at(sample.elapsed);
        let (low, high) = (a.min(b), a.max(b));
        assert!(
            sample.active >= low && sample.active <= high,
            "{} active VUs at {:?} is outside [{}, {}]",
            sample.active,
            sample.elapsed,
            low,
            high
        );
    }

    assert_eq!(summary.timeline.last().map(|s| s.active), Some(0));
}

#[tokio::test]
async fn ramp_down_keeps_in_flight_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(600)))
        .mount(&server)
        .await;

    let config = config_for(
        &server.uri(),
        LoadProfile::Staged {
            stages: vec![stage(200, 2), stage(200, 0)],
        },
    );
    let aggregator = Arc::new(MetricsAggregator::with_retained_outcomes());
    let engine = Engine::with_aggregator(config, Arc::clone(&aggregator));

    let summary = engine.run().await.unwrap();

    // Every VU was cancelled mid-request; those requests still count.
    assert!(summary.total_requests >= 1);
    assert_eq!(summary.failures, 0);
    for outcome in aggregator.outcomes() {
        assert_eq!(outcome.status_code, Some(200));
        assert!(outcome.latency >= Duration::from_millis(600));
    }
}

#[tokio::test]
async fn admission_limit_caps_concurrency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(
        &server.uri(),
        LoadProfile::Staged {
            stages: vec![stage(0, 10), stage(300, 10)],
        },
    );
    config.pacing = Pacing::Fixed(Duration::from_millis(10));
    config.scheduler.max_vus = Some(3);

    let summary = Engine::new(config).run().await.unwrap();

    assert_eq!(summary.peak_concurrency, 3);
    assert!(summary.total_requests > 0);
}

// --- Cancellation ---

#[tokio::test]
async fn run_timeout_stops_a_long_profile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(
        &server.uri(),
        LoadProfile::Staged {
            stages: vec![stage(30_000, 2)],
        },
    );
    config.pacing = Pacing::Fixed(Duration::from_millis(20));
    config.run_timeout = Some(Duration::from_millis(300));

    let start = std::time::Instant::now();
    let summary = Engine::new(config).run().await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(summary.total_requests > 0);
}

#[tokio::test]
async fn external_cancel_stops_a_fixed_run_early() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri(), fixed(2, 1_000_000));
    config.pacing = Pacing::Fixed(Duration::from_millis(50));

    let engine = Engine::new(config);
    let token = engine.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let summary = engine.run().await.unwrap();

    assert!(summary.total_requests > 0);
    assert!(summary.total_requests < 1_000_000);
}

// --- Progress reporting ---

#[tokio::test]
async fn periodic_report_runs_until_cancelled() {
    let aggregator = Arc::new(MetricsAggregator::new());
    let token = CancellationToken::new();
    let handle = aggregator.spawn_periodic_report(Duration::from_millis(10), token.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("report task did not stop after cancellation")
        .unwrap();
}

#[tokio::test]
async fn run_with_summary_interval_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri(), fixed(2, 10));
    config.pacing = Pacing::Fixed(Duration::from_millis(10));
    config.summary_interval = Some(Duration::from_millis(15));

    let summary = tokio::time::timeout(Duration::from_secs(5), Engine::new(config).run())
        .await
        .expect("engine did not stop its progress reporter")
        .unwrap();

    assert_eq!(summary.total_requests, 10);
}
