//! Chrome process management and the DevTools HTTP endpoint.

use crate::base::error::AuditError;
use crate::browser::cdp::CdpConnection;
use crate::browser::page::CdpPage;
use crate::browser::PageFactory;
use crate::config::BrowserConfig;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

const STARTUP_POLL: Duration = Duration::from_millis(100);

/// `/json/version` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}

/// One entry of `/json/new`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: String,
    #[serde(default)]
    pub url: String,
    pub web_socket_debugger_url: String,
}

/// The HTTP side of a DevTools endpoint (`/json/*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevtoolsEndpoint {
    pub host: String,
    pub port: u16,
}

impl DevtoolsEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `http://host:port` (any path is ignored).
    pub fn parse(endpoint: &str) -> Result<Self, AuditError> {
        let url = Url::parse(endpoint)
            .map_err(|e| AuditError::launch(format!("invalid DevTools endpoint {endpoint}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuditError::launch(format!("DevTools endpoint {endpoint} has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AuditError::launch(format!("DevTools endpoint {endpoint} has no port")))?;
        Ok(Self::new(host, port))
    }

    pub async fn version(&self) -> Result<BrowserVersion, AuditError> {
        let body = self.request(Method::GET, "/json/version").await?;
        serde_json::from_slice(&body).map_err(|e| AuditError::Cdp(format!("/json/version: {e}")))
    }

    /// Open a blank tab.
    pub async fn new_tab(&self) -> Result<TabInfo, AuditError> {
        let body = self.request(Method::PUT, "/json/new?about:blank").await?;
        serde_json::from_slice(&body).map_err(|e| AuditError::Cdp(format!("/json/new: {e}")))
    }

    pub async fn close_tab(&self, id: &str) -> Result<(), AuditError> {
        let body = self.request(Method::GET, &format!("/json/close/{id}")).await?;
        debug!(id, reply = %String::from_utf8_lossy(&body).trim(), "tab closed");
        Ok(())
    }

    async fn request(&self, method: Method, path: &str) -> Result<Bytes, AuditError> {
        let http_err = |e: &dyn std::fmt::Display| AuditError::Cdp(format!("{method} {path}: {e}"));

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| http_err(&e))?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| http_err(&e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "DevTools HTTP connection ended");
            }
        });

        let req = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(http::header::HOST, format!("{}:{}", self.host, self.port))
            .body(Empty::<Bytes>::new())
            .map_err(|e| http_err(&e))?;
        let resp = sender.send_request(req).await.map_err(|e| http_err(&e))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| http_err(&e))?
            .to_bytes();
        if !status.is_success() {
            return Err(http_err(&format!(
                "status {status}: {}",
                String::from_utf8_lossy(&body).trim()
            )));
        }
        Ok(body)
    }
}

/// A Chrome instance, launched by us or attached to.
#[derive(Debug)]
pub struct ChromeBrowser {
    endpoint: DevtoolsEndpoint,
    /// `None` when attached to a browser we do not own.
    child: Option<Child>,
    page_load_timeout: Duration,
    command_timeout: Duration,
}

impl ChromeBrowser {
    /// Attach to `config.attach_to` when set, otherwise launch.
    pub async fn start(config: &BrowserConfig, proxy_addr: SocketAddr) -> Result<Self, AuditError> {
        match &config.attach_to {
            Some(endpoint) => Self::attach(config, endpoint).await,
            None => Self::launch(config, proxy_addr).await,
        }
    }

    /// Start Chrome with its traffic routed through `proxy_addr` and wait for
    /// the DevTools endpoint to answer.
    pub async fn launch(config: &BrowserConfig, proxy_addr: SocketAddr) -> Result<Self, AuditError> {
        let port = free_port()?;
        let user_data_dir = config
            .user_data_dir
            .clone()
            .unwrap_or_else(|| default_profile_dir(port));

        let mut command = Command::new(&config.executable);
        command
            .args(launch_args(config, proxy_addr, port, &user_data_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| {
            AuditError::launch(format!("spawn {}: {e}", config.executable.display()))
        })?;

        let mut browser = Self {
            endpoint: DevtoolsEndpoint::new("127.0.0.1", port),
            child: Some(child),
            page_load_timeout: config.page_load_timeout,
            command_timeout: config.command_timeout,
        };
        let version = browser.wait_until_up(config.startup_timeout).await?;
        info!(
            browser = %version.browser,
            port,
            proxy = %proxy_addr,
            profile = %user_data_dir.display(),
            "Chrome started"
        );
        Ok(browser)
    }

    /// Use an already running browser's DevTools endpoint.
    pub async fn attach(config: &BrowserConfig, endpoint: &str) -> Result<Self, AuditError> {
        let endpoint = DevtoolsEndpoint::parse(endpoint)?;
        let version = endpoint.version().await.map_err(|e| {
            AuditError::launch(format!("DevTools endpoint {}:{}: {e}", endpoint.host, endpoint.port))
        })?;
        info!(browser = %version.browser, host = %endpoint.host, port = endpoint.port, "attached to browser");
        Ok(Self {
            endpoint,
            child: None,
            page_load_timeout: config.page_load_timeout,
            command_timeout: config.command_timeout,
        })
    }

    pub fn endpoint(&self) -> &DevtoolsEndpoint {
        &self.endpoint
    }

    async fn wait_until_up(&mut self, startup_timeout: Duration) -> Result<BrowserVersion, AuditError> {
        let deadline = tokio::time::Instant::now() + startup_timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                let exited = child
                    .try_wait()
                    .map_err(|e| AuditError::launch(format!("wait: {e}")))?;
                if let Some(status) = exited {
                    return Err(AuditError::launch(format!("Chrome exited early with {status}")));
                }
            }
            match self.endpoint.version().await {
                Ok(version) => return Ok(version),
                Err(e) => debug!(error = %e, "DevTools endpoint not up yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AuditError::launch(format!(
                    "DevTools endpoint on port {} did not answer within {}ms",
                    self.endpoint.port,
                    startup_timeout.as_millis()
                )));
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    /// Stop a launched browser. Attached browsers are left running.
    pub async fn shutdown(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to stop Chrome");
        } else {
            info!("Chrome stopped");
        }
    }
}

impl PageFactory for ChromeBrowser {
    type Driver = CdpPage;

    async fn open_page(&self) -> Result<CdpPage, AuditError> {
        let tab = self.endpoint.new_tab().await?;
        debug!(id = %tab.id, "tab opened");
        let conn = CdpConnection::connect(&tab.web_socket_debugger_url, self.command_timeout).await?;
        CdpPage::attach(conn, tab.id, self.page_load_timeout, Some(self.endpoint.clone())).await
    }
}

fn launch_args(config: &BrowserConfig, proxy_addr: SocketAddr, port: u16, user_data_dir: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        format!("--proxy-server=http://{proxy_addr}"),
        // The proxy re-signs every origin with its own CA.
        "--ignore-certificate-errors".to_string(),
        format!("--remote-debugging-port={port}"),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}

fn free_port() -> Result<u16, AuditError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| AuditError::launch(format!("bind port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| AuditError::launch(format!("local_addr: {e}")))?
        .port();
    Ok(port)
}

fn default_profile_dir(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("tcfaudit-profile-{port}"))
}
