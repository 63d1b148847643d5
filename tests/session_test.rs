mod common;

use common::{FakePage, PageScript};
use std::time::Duration;
use tcfaudit::config::SessionConfig;
use tcfaudit::consent::{ConsentCodec, ConsentPolicy, ConsentRecordBuilder, TcfV2Codec};
use tcfaudit::session::{BrowserSession, CmpMetadata, SessionState};

fn builder() -> ConsentRecordBuilder {
    ConsentRecordBuilder::new(ConsentPolicy::default())
}

#[tokio::test(start_paused = true)]
async fn test_full_sequence_reaches_done() {
    let page = FakePage::new(PageScript::default());
    let builder = builder();
    let config = SessionConfig::default();

    let report = BrowserSession::new(&page, &builder, &config, "https://site.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Done);
    assert_eq!(
        report.transitions,
        vec![
            SessionState::Navigated,
            SessionState::ApiReady,
            SessionState::ConsentInjected,
            SessionState::Reloaded,
            SessionState::Done,
        ]
    );
    assert!(report.api_ready_before);
    assert!(report.api_ready_after);
    assert_eq!(report.metadata.cmp_id, 28);
    assert_eq!(report.metadata.cmp_version, 3);
    assert_eq!(report.metadata.vendor_list_version, 200);
    assert_eq!(report.event_status_before, "cmpuishown");
    assert_eq!(report.event_status_after, "tcloaded");
    assert_eq!(report.display_status_after, "hidden");
    assert!(report.failure.is_none());

    let injected = report.injected.clone().expect("consent injected");
    assert_eq!(page.injected().as_deref(), Some(injected.as_str()));
    assert_eq!(report.reported.as_deref(), Some(injected.as_str()));

    let decoded = TcfV2Codec.decode(&injected).unwrap();
    assert_eq!(decoded.cmp_id, 28);
    assert_eq!(decoded.cmp_version, 3);
    assert_eq!(decoded.vendor_list_version, 200);
}

#[tokio::test(start_paused = true)]
async fn test_steps_run_in_order() {
    let page = FakePage::new(PageScript::default());
    let builder = builder();
    let config = SessionConfig::default();

    BrowserSession::new(&page, &builder, &config, "https://site.example")
        .run()
        .await;

    let calls = page.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert_eq!(calls.first().map(String::as_str), Some("navigate:https://site.example"));
    assert_eq!(calls.last().map(String::as_str), Some("navigate:about:blank"));
    assert!(position("eval:defined") < position("eval:inject"));
    assert!(position("eval:inject") < position("reload"));
    let last_tcdata = calls.iter().rposition(|c| c == "eval:tcdata").unwrap();
    assert!(position("reload") < last_tcdata);
}

#[tokio::test(start_paused = true)]
async fn test_api_never_ready_uses_defaults() {
    let page = FakePage::new(PageScript::without_cmp());
    let builder = builder();
    let config = SessionConfig::default();

    let start = tokio::time::Instant::now();
    let report = BrowserSession::new(&page, &builder, &config, "https://no-cmp.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Done);
    assert!(!report.api_ready_before);
    assert!(!report.api_ready_after);
    assert_eq!(report.metadata, CmpMetadata::default());
    assert_eq!(report.metadata.cmp_id, 0);
    assert_eq!(report.metadata.cmp_version, 1);
    assert_eq!(report.metadata.vendor_list_version, 189);
    assert_eq!(report.event_status_before, "");
    assert!(report.reported.is_none());

    // The record is still built and injected, from the defaults.
    let record = report.record.expect("record built");
    assert_eq!(record.cmp_id, 0);
    assert_eq!(record.vendor_list_version, 189);
    assert!(page.injected().is_some());

    // Two full readiness waits, before and after the reload.
    assert!(start.elapsed() >= config.readiness.timeout * 2);
}

#[tokio::test(start_paused = true)]
async fn test_script_errors_fall_back() {
    let page = FakePage::new(PageScript {
        scripts_throw: true,
        ..PageScript::default()
    });
    let builder = builder();
    let config = SessionConfig::default();

    let report = BrowserSession::new(&page, &builder, &config, "https://broken.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Done);
    assert_eq!(report.metadata, CmpMetadata::default());
    assert!(report.injected.is_some());
    assert!(report.reported.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_ping_field_falls_back_alone() {
    let page = FakePage::new(PageScript {
        ping_overrides: Some(serde_json::json!({ "cmpVersion": "2.1", "gvlVersion": 5000 })),
        ..PageScript::default()
    });
    let builder = builder();
    let config = SessionConfig::default();

    let report = BrowserSession::new(&page, &builder, &config, "https://odd-cmp.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Done);
    assert!(report.api_ready_before);
    assert_eq!(report.metadata.cmp_id, 28);
    assert_eq!(report.metadata.cmp_version, 1);
    assert_eq!(report.metadata.vendor_list_version, 189);
    assert_eq!(report.display_status_after, "hidden");

    let decoded = TcfV2Codec.decode(&report.injected.unwrap()).unwrap();
    assert_eq!(decoded.cmp_id, 28);
    assert_eq!(decoded.vendor_list_version, 189);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_failure_fails_session() {
    let page = FakePage::new(PageScript {
        navigate_error: Some("net::ERR_NAME_NOT_RESOLVED".into()),
        ..PageScript::default()
    });
    let builder = builder();
    let config = SessionConfig::default();

    let report = BrowserSession::new(&page, &builder, &config, "https://gone.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(report.transitions, vec![SessionState::Failed]);
    assert!(report.failure.unwrap().contains("ERR_NAME_NOT_RESOLVED"));
    assert!(report.injected.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_keeps_partial_results() {
    let page = FakePage::new(PageScript {
        reload_delay: Some(Duration::from_secs(300)),
        ..PageScript::default()
    });
    let builder = builder();
    let config = SessionConfig {
        deadline: Duration::from_secs(60),
        ..SessionConfig::default()
    };

    let report = BrowserSession::new(&page, &builder, &config, "https://slow.example")
        .run()
        .await;

    assert_eq!(report.state, SessionState::Failed);
    assert_eq!(
        report.transitions,
        vec![
            SessionState::Navigated,
            SessionState::ApiReady,
            SessionState::ConsentInjected,
            SessionState::Failed,
        ]
    );
    assert!(report.failure.unwrap().contains("deadline"));
    assert_eq!(report.metadata.cmp_id, 28);
    assert!(report.injected.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_deny_all_policy_injects_refusal() {
    let page = FakePage::new(PageScript::default());
    let builder = ConsentRecordBuilder::new(ConsentPolicy::DenyAll);
    let config = SessionConfig::default();

    let report = BrowserSession::new(&page, &builder, &config, "https://site.example")
        .run()
        .await;

    let decoded = TcfV2Codec.decode(report.injected.as_deref().unwrap()).unwrap();
    assert!(decoded.consented_purposes().is_empty());
    assert_eq!(decoded.cmp_id, 28);
}
