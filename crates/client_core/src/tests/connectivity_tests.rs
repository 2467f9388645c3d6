use super::*;
use crate::{
    config::ClientSettings,
    gateway::HttpGateway,
    notify::{Notice, NoticeLevel},
    test_support::FakeGateway,
};
use std::time::Instant;
use tokio::{net::TcpListener, sync::broadcast::error::TryRecvError};

const SERVER_URL: &str = "http://localhost:8000";

fn monitor(fake: &Arc<FakeGateway>, notifier: &Notifier) -> ConnectivityMonitor {
    ConnectivityMonitor::new(fake.clone(), notifier.clone(), SERVER_URL)
}

/// An address nothing is listening on.
async fn closed_port_url() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn starts_disconnected_and_unchecked() {
    let monitor = monitor(&FakeGateway::new(), &Notifier::new());
    let state = monitor.state().await;
    assert!(!state.is_connected);
    assert_eq!(state.last_checked_at, None);
    assert!(!monitor.is_checking());
}

#[tokio::test]
async fn healthy_server_marks_connected() {
    let fake = FakeGateway::new();
    let monitor = monitor(&fake, &Notifier::new());

    let state = monitor.auto_check().await;

    assert!(state.is_connected);
    assert!(state.last_checked_at.is_some());
    assert_eq!(state.last_error, None);
    assert!(monitor.is_connected().await);
}

#[tokio::test]
async fn silent_check_publishes_nothing() {
    let fake = FakeGateway::new();
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let monitor = monitor(&fake, &notifier);

    monitor.check(CheckMode::Silent).await;
    fake.fail_next(
        "health",
        GatewayError::new(ErrorKind::Refused, "connection refused"),
    );
    monitor.check(CheckMode::Silent).await;

    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn verbose_success_publishes_one_notice() {
    let fake = FakeGateway::new();
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let monitor = monitor(&fake, &notifier);

    monitor.check(CheckMode::Verbose).await;

    assert_eq!(
        notices.try_recv().expect("notice"),
        Notice {
            level: NoticeLevel::Success,
            message: "server connection ok".to_string(),
        }
    );
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn verbose_failure_message_depends_on_kind() {
    let fake = FakeGateway::new();
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let monitor = monitor(&fake, &notifier);

    fake.fail_next(
        "health",
        GatewayError::new(ErrorKind::Refused, "connection refused"),
    );
    monitor.check(CheckMode::Verbose).await;
    fake.fail_next(
        "health",
        GatewayError::http(500, "server error: boom"),
    );
    monitor.check(CheckMode::Verbose).await;

    let refused = notices.try_recv().expect("refused notice");
    assert_eq!(refused.level, NoticeLevel::Error);
    assert_eq!(
        refused.message,
        format!("cannot reach server at {SERVER_URL}; make sure it is running")
    );
    let other = notices.try_recv().expect("server error notice");
    assert_eq!(other.message, "connection failed: server error: boom");
}

#[tokio::test]
async fn slow_probe_is_abandoned_as_timeout() {
    let fake = FakeGateway::new();
    fake.state().health_delay = Some(Duration::from_secs(30));
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let monitor = monitor(&fake, &notifier);

    let started = Instant::now();
    let state = monitor
        .check_within(Duration::from_millis(50), CheckMode::Verbose)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!state.is_connected);
    let failure = state.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.message, "no answer within 50 ms");
    assert_eq!(
        notices.try_recv().expect("notice").message,
        "connection timed out; check the server status"
    );
    assert!(!monitor.is_checking());
}

#[tokio::test]
async fn recovery_clears_last_error() {
    let fake = FakeGateway::new();
    let monitor = monitor(&fake, &Notifier::new());
    fake.fail_next(
        "health",
        GatewayError::new(ErrorKind::Refused, "connection refused"),
    );

    let down = monitor.auto_check().await;
    assert!(!down.is_connected);
    let up = monitor.auto_check().await;
    assert!(up.is_connected);
    assert_eq!(up.last_error, None);
}

#[tokio::test]
async fn in_flight_probe_is_reported_as_checking() {
    let fake = FakeGateway::new();
    let monitor = Arc::new(monitor(&fake, &Notifier::new()));
    let release = fake.hold_next("health");

    let probe = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.auto_check().await })
    };
    fake.wait_for_calls(1).await;
    assert!(monitor.is_checking());

    release.send(()).expect("release");
    let state = probe.await.expect("join");
    assert!(state.is_connected);
    assert!(!monitor.is_checking());
}

#[tokio::test]
async fn refused_server_fails_fast_with_single_notice() {
    let base = closed_port_url().await;
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let settings = ClientSettings::with_api_base(&base).expect("settings");
    let gateway = Arc::new(HttpGateway::new(&settings, notifier.clone()).expect("gateway"));
    let monitor = ConnectivityMonitor::new(gateway, notifier.clone(), base.clone());

    let started = Instant::now();
    let state = monitor.check(CheckMode::Verbose).await;

    assert!(started.elapsed() < HEALTH_TIMEOUT);
    let failure = state.last_error.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Refused);
    assert_eq!(
        notices.try_recv().expect("notice").message,
        format!("cannot reach server at {base}; make sure it is running")
    );
    assert!(matches!(notices.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn periodic_checks_run_until_aborted() {
    let fake = FakeGateway::new();
    let monitor = Arc::new(monitor(&fake, &Notifier::new()));

    let handle = monitor.spawn_periodic(Duration::from_millis(10));
    fake.wait_for_calls(3).await;
    handle.abort();
    let _ = handle.await;

    assert!(monitor.is_connected().await);
    let calls = fake.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.call_count(), calls);
}

#[tokio::test]
async fn zero_period_falls_back_to_minimum_cadence() {
    let fake = FakeGateway::new();
    let monitor = Arc::new(monitor(&fake, &Notifier::new()));

    let handle = monitor.spawn_periodic(Duration::ZERO);
    fake.wait_for_calls(2).await;
    handle.abort();

    assert!(!handle.await.expect_err("aborted").is_panic());
}
