mod common;

use common::{cookie_origin, free_port, FakePages, PageScript};
use std::net::SocketAddr;
use tcfaudit::config::{ProxyConfig, SessionConfig};
use tcfaudit::consent::{ConsentPolicy, ConsentRecordBuilder};
use tcfaudit::runner::{ComplianceCondition, ComplianceRunner, DomainRunner};
use tcfaudit::session::SessionState;
use tcfaudit::AuditError;
use time::OffsetDateTime;

fn runner(pages: FakePages, listen_addr: SocketAddr) -> ComplianceRunner<FakePages> {
    let proxy = ProxyConfig {
        listen_addr,
        ..ProxyConfig::default()
    };
    ComplianceRunner::new(
        pages,
        ConsentRecordBuilder::new(ConsentPolicy::default()),
        proxy,
        SessionConfig::default(),
        None,
    )
}

#[tokio::test]
async fn test_third_party_cookies_become_rows() {
    let (origin, _) = cookie_origin(vec![
        "uid=abc; Expires=Wed, 21 Oct 2099 07:28:00 GMT; Path=/".into(),
        "tmp=1; Path=/".into(),
    ])
    .await;
    let proxy_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let pages = FakePages::new(PageScript {
        fetch_via_proxy: Some((proxy_addr, format!("http://{origin}/pixel"))),
        ..PageScript::default()
    });
    let runner = runner(pages, proxy_addr);

    let outcome = runner.run_domain("site.example").await.unwrap();

    assert!(outcome.capture_active);
    assert_eq!(outcome.session.state, SessionState::Done);
    assert_eq!(outcome.cookies.len(), 2);
    assert!(outcome.cookies.iter().all(|c| c.domain == "127.0.0.1"));
    assert!(outcome.strings_agree());
    assert!(outcome.status_changed());
    assert_eq!(outcome.condition(), ComplianceCondition::Respected);

    let rows = outcome.results(OffsetDateTime::now_utc());
    assert_eq!(rows.len(), 1, "session cookie has no expiry and is skipped");
    let row = &rows[0];
    assert_eq!(row.website, "site.example");
    assert_eq!(row.name, "uid");
    assert_eq!(row.value, "abc");
    assert_eq!(row.injected, row.reported);
    assert_eq!(row.event_status_before, "cmpuishown");
    assert_eq!(row.event_status_after, "tcloaded");

    let page = &runner.pages().opened()[0];
    assert_eq!(page.calls().last().map(String::as_str), Some("close"));
}

#[tokio::test]
async fn test_bind_failure_runs_degraded() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap();
    let runner = runner(FakePages::new(PageScript::default()), taken);

    let outcome = runner.run_domain("site.example").await.unwrap();

    assert!(!outcome.capture_active);
    assert!(outcome.cookies.is_empty());
    assert_eq!(outcome.session.state, SessionState::Done);
    assert!(outcome.session.injected.is_some());
}

#[tokio::test]
async fn test_page_failure_is_error_and_releases_proxy() {
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let pages = FakePages::new(PageScript::default());
    pages.fail_opens.lock().unwrap().push(0);
    let runner = runner(pages, addr);

    let err = runner.run_domain("a.example").await.unwrap_err();
    assert!(matches!(err, AuditError::BrowserLaunch { .. }));

    // The proxy from the failed attempt no longer holds the port.
    let outcome = runner.run_domain("b.example").await.unwrap();
    assert!(outcome.capture_active);
}

#[tokio::test]
async fn test_mismatched_string_is_overridden() {
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let runner = runner(
        FakePages::new(PageScript {
            echo_injected: false,
            ..PageScript::default()
        }),
        addr,
    );

    let outcome = runner.run_domain("site.example").await.unwrap();
    assert!(!outcome.strings_agree());
    assert_eq!(outcome.condition(), ComplianceCondition::Overridden);
}
