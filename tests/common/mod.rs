//! Scripted browser fakes shared by the integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcfaudit::browser::{BrowserDriver, PageFactory};
use tcfaudit::session::scripts::API_DEFINED;
use tcfaudit::AuditError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How a fake page behaves.
#[derive(Debug, Clone)]
pub struct PageScript {
    /// Whether `__tcfapi` exists and answers pings.
    pub cmp: bool,
    pub cmp_id: u16,
    pub cmp_version: u16,
    pub gvl_version: u16,
    pub display_status_after: String,
    pub event_status_before: String,
    pub event_status_after: String,
    /// Echo the injected string back from `getTCData` after the reload.
    pub echo_injected: bool,
    pub navigate_error: Option<String>,
    /// Every script evaluation throws.
    pub scripts_throw: bool,
    /// Stall every reload for this long.
    pub reload_delay: Option<Duration>,
    /// On each real navigation, fetch this URL through this proxy.
    pub fetch_via_proxy: Option<(SocketAddr, String)>,
    /// Raw fields laid over every ping answer.
    pub ping_overrides: Option<Value>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            cmp: true,
            cmp_id: 28,
            cmp_version: 3,
            gvl_version: 200,
            display_status_after: "hidden".into(),
            event_status_before: "cmpuishown".into(),
            event_status_after: "tcloaded".into(),
            echo_injected: true,
            navigate_error: None,
            scripts_throw: false,
            reload_delay: None,
            fetch_via_proxy: None,
            ping_overrides: None,
        }
    }
}

impl PageScript {
    pub fn without_cmp() -> Self {
        Self {
            cmp: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct PageState {
    reloaded: bool,
    injected: Option<String>,
}

/// A page that answers the session's scripts from a [`PageScript`].
#[derive(Debug, Clone)]
pub struct FakePage {
    script: PageScript,
    state: Arc<Mutex<PageState>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakePage {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            state: Arc::default(),
            calls: Arc::default(),
        }
    }

    /// `navigate:<url>`, `eval:<kind>`, `reload`, `close`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn injected(&self) -> Option<String> {
        self.state.lock().unwrap().injected.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn answer(&self, expression: &str) -> Result<Value, AuditError> {
        if expression == API_DEFINED {
            self.record("eval:defined");
            return Ok(json!(self.script.cmp));
        }
        if expression.contains("localStorage.setItem") {
            self.record("eval:inject");
            self.state.lock().unwrap().injected = Some(injected_literal(expression));
            return Ok(json!(true));
        }
        if !self.script.cmp {
            self.record("eval:unanswered");
            return Ok(Value::Null);
        }
        let reloaded = self.state.lock().unwrap().reloaded;
        if expression.contains("'ping'") {
            self.record("eval:ping");
            let display = if reloaded {
                self.script.display_status_after.as_str()
            } else {
                "visible"
            };
            let mut ping = json!({
                "cmpId": self.script.cmp_id,
                "cmpVersion": self.script.cmp_version,
                "gvlVersion": self.script.gvl_version,
                "displayStatus": display,
            });
            if let Some(Value::Object(fields)) = &self.script.ping_overrides {
                for (key, value) in fields {
                    ping[key] = value.clone();
                }
            }
            return Ok(ping);
        }
        if expression.contains("'getTCData'") {
            self.record("eval:tcdata");
            let state = self.state.lock().unwrap();
            return Ok(if state.reloaded {
                let tc = if self.script.echo_injected {
                    state.injected.clone()
                } else {
                    Some("COtherCmpString.IAAA".to_string())
                };
                json!({ "tcString": tc, "eventStatus": self.script.event_status_after })
            } else {
                json!({ "tcString": "", "eventStatus": self.script.event_status_before })
            });
        }
        self.record("eval:other");
        Ok(Value::Null)
    }
}

/// Pull the consent string out of the injection script.
fn injected_literal(script: &str) -> String {
    let start = script.find("const tc = ").unwrap() + "const tc = ".len();
    let end = start + script[start..].find(";\n").unwrap();
    serde_json::from_str(&script[start..end]).unwrap()
}

impl BrowserDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), AuditError> {
        self.record(format!("navigate:{url}"));
        if url == "about:blank" {
            return Ok(());
        }
        if let Some(reason) = &self.script.navigate_error {
            return Err(AuditError::navigation(url, reason.clone()));
        }
        if let Some((proxy, target)) = &self.script.fetch_via_proxy {
            fetch_through_proxy(*proxy, target).await;
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str, _await_promise: bool) -> Result<Value, AuditError> {
        if self.script.scripts_throw {
            self.record("eval:throw");
            return Err(AuditError::script("TypeError: cannot read properties of undefined"));
        }
        self.answer(expression)
    }

    async fn reload(&self) -> Result<(), AuditError> {
        self.record("reload");
        if let Some(delay) = self.script.reload_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().reloaded = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        self.record("close");
        Ok(())
    }
}

/// Hands out pages built from one script and remembers them.
#[derive(Debug, Default)]
pub struct FakePages {
    script: Mutex<PageScript>,
    pub opened: Mutex<Vec<FakePage>>,
    /// `open_page` attempts (0-based) that fail.
    pub fail_opens: Mutex<Vec<usize>>,
    attempts: AtomicUsize,
}

impl FakePages {
    pub fn new(script: PageScript) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    pub fn set_script(&self, script: PageScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn opened(&self) -> Vec<FakePage> {
        self.opened.lock().unwrap().clone()
    }
}

impl PageFactory for FakePages {
    type Driver = FakePage;

    async fn open_page(&self) -> Result<FakePage, AuditError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens.lock().unwrap().contains(&attempt) {
            return Err(AuditError::launch("tab could not be created"));
        }
        let page = FakePage::new(self.script.lock().unwrap().clone());
        self.opened.lock().unwrap().push(page.clone());
        Ok(page)
    }
}

/// Plain-HTTP GET through the proxy in absolute form; the body is drained.
pub async fn fetch_through_proxy(proxy: SocketAddr, url: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let host = url
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap()
        .to_string();
    let request = format!("GET {url} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Origin answering every request with the given `Set-Cookie` lines.
/// Returns the origin address and a log of raw request heads.
pub async fn cookie_origin(set_cookies: Vec<String>) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let set_cookies = Arc::new(set_cookies);

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let set_cookies = set_cookies.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    log.lock().unwrap().push(String::from_utf8_lossy(&buf[..n]).to_string());
                    let mut response = String::from("HTTP/1.1 200 OK\r\n");
                    for line in set_cookies.iter() {
                        response.push_str(&format!("Set-Cookie: {line}\r\n"));
                    }
                    response.push_str("Content-Length: 2\r\nConnection: close\r\n\r\nok");
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });
    (addr, seen)
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
