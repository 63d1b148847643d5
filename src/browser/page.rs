use crate::base::error::AuditError;
use crate::browser::cdp::{CdpConnection, CdpEvent};
use crate::browser::launcher::DevtoolsEndpoint;
use crate::browser::BrowserDriver;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const LOAD_EVENT: &str = "Page.loadEventFired";

/// One browser tab driven over DevTools.
#[derive(Debug)]
pub struct CdpPage {
    conn: CdpConnection,
    target_id: String,
    page_load_timeout: Duration,
    /// Used to close the tab when `Page.close` is refused.
    endpoint: Option<DevtoolsEndpoint>,
}

impl CdpPage {
    /// Take over a tab whose WebSocket is already open.
    pub async fn attach(
        conn: CdpConnection,
        target_id: impl Into<String>,
        page_load_timeout: Duration,
        endpoint: Option<DevtoolsEndpoint>,
    ) -> Result<Self, AuditError> {
        conn.send("Page.enable", json!({})).await?;
        Ok(Self {
            conn,
            target_id: target_id.into(),
            page_load_timeout,
            endpoint,
        })
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Wait for the next load event. A missing load event is not fatal;
    /// slow pages are still polled.
    async fn wait_for_load(&self, mut events: broadcast::Receiver<CdpEvent>, url: &str) -> Result<(), AuditError> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == LOAD_EVENT => return Ok(()),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "DevTools events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(AuditError::CdpClosed),
                }
            }
        };
        match tokio::time::timeout(self.page_load_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    url = %url,
                    timeout_ms = self.page_load_timeout.as_millis() as u64,
                    "load event not seen, continuing"
                );
                Ok(())
            }
        }
    }
}

impl BrowserDriver for CdpPage {
    async fn navigate(&self, url: &str) -> Result<(), AuditError> {
        let events = self.conn.subscribe();
        let result = self
            .conn
            .send("Page.navigate", json!({ "url": url }))
            .await
            .map_err(|e| match e {
                AuditError::Cdp(reason) => AuditError::navigation(url, reason),
                other => other,
            })?;
        if let Some(error_text) = result
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            return Err(AuditError::navigation(url, error_text));
        }
        self.wait_for_load(events, url).await
    }

    async fn evaluate(&self, expression: &str, await_promise: bool) -> Result<Value, AuditError> {
        let result = self
            .conn
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await
            .map_err(|e| match e {
                // The page's context went away mid-evaluation, e.g. a CMP redirect.
                AuditError::Cdp(reason) => AuditError::script(reason),
                other => other,
            })?;
        if let Some(exception) = result.get("exceptionDetails") {
            let reason = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Err(AuditError::script(reason));
        }
        Ok(result["result"].get("value").cloned().unwrap_or(Value::Null))
    }

    async fn reload(&self) -> Result<(), AuditError> {
        let events = self.conn.subscribe();
        self.conn.send("Page.reload", json!({})).await?;
        self.wait_for_load(events, "(reload)").await
    }

    async fn close(&self) -> Result<(), AuditError> {
        match self.conn.send("Page.close", json!({})).await {
            Ok(_) => Ok(()),
            Err(e) => match &self.endpoint {
                Some(endpoint) => {
                    debug!(target_id = %self.target_id, error = %e, "Page.close refused, closing tab over HTTP");
                    endpoint.close_tab(&self.target_id).await
                }
                None => Err(e),
            },
        }
    }
}
