//! Consent-injection session for one page.
//!
//! `BrowserSession` walks a fixed sequence of states:
//!
//! ```text
//! Idle ─► Navigated ─► ApiReady ─► ConsentInjected ─► Reloaded ─► Done
//!   └──────────┴────────────┴──────────────┴──────────────┴─────► Failed
//! ```
//!
//! Page-level script failures never fail the session; they fall back to the
//! configured defaults and the walk continues. Navigation, reload and
//! transport failures, and the overall deadline, end in `Failed`. Whatever
//! was read before the failure stays in the [`SessionReport`].

pub mod metadata;
pub mod scripts;
pub mod wait;

pub use metadata::CmpMetadata;
pub use wait::{poll_until, PollConfig, PollOutcome};

use crate::base::error::{AuditError, ErrorClass};
use crate::browser::BrowserDriver;
use crate::config::SessionConfig;
use crate::consent::{ConsentCodec, ConsentRecord, ConsentRecordBuilder};
use scripts::{PingReturn, TcDataReturn};
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Navigated,
    ApiReady,
    ConsentInjected,
    Reloaded,
    Done,
    Failed,
}

/// What one session observed.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub url: String,
    pub state: SessionState,
    /// States entered, in order, starting after `Idle`.
    pub transitions: Vec<SessionState>,
    pub metadata: CmpMetadata,
    pub api_ready_before: bool,
    pub api_ready_after: bool,
    pub record: Option<ConsentRecord>,
    /// Consent string written into the page.
    pub injected: Option<String>,
    /// Consent string the page reported after the reload.
    pub reported: Option<String>,
    pub event_status_before: String,
    pub event_status_after: String,
    /// CMP `displayStatus` after the reload.
    pub display_status_after: String,
    pub failure: Option<String>,
}

impl SessionReport {
    /// A report for a session that has not started: every field holds its
    /// configured fallback.
    pub fn pending(url: &str, config: &SessionConfig) -> Self {
        Self {
            url: url.to_string(),
            state: SessionState::Idle,
            transitions: Vec::new(),
            metadata: config.fallback.clone(),
            api_ready_before: false,
            api_ready_after: false,
            record: None,
            injected: None,
            reported: None,
            event_status_before: config.fallback_event_status.clone(),
            event_status_after: config.fallback_event_status.clone(),
            display_status_after: config.fallback.display_status.clone(),
            failure: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }
}

/// Drives one page through navigate, read, inject, reload, re-read.
pub struct BrowserSession<'a, D, C> {
    driver: &'a D,
    builder: &'a ConsentRecordBuilder<C>,
    config: &'a SessionConfig,
    report: SessionReport,
}

impl<'a, D, C> BrowserSession<'a, D, C>
where
    D: BrowserDriver,
    C: ConsentCodec,
{
    pub fn new(
        driver: &'a D,
        builder: &'a ConsentRecordBuilder<C>,
        config: &'a SessionConfig,
        url: &str,
    ) -> Self {
        Self {
            driver,
            builder,
            config,
            report: SessionReport::pending(url, config),
        }
    }

    pub fn state(&self) -> SessionState {
        self.report.state
    }

    /// Run to `Done` or `Failed` within the session deadline.
    pub async fn run(mut self) -> SessionReport {
        let deadline = self.config.deadline;
        let result = match tokio::time::timeout(deadline, self.do_loop()).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::SessionDeadline {
                timeout_ms: deadline.as_millis() as u64,
            }),
        };
        if let Err(e) = result {
            warn!(url = %self.report.url, state = ?self.report.state, error = %e, "session failed");
            self.report.failure = Some(e.to_string());
            self.transition(SessionState::Failed);
        }
        self.report
    }

    async fn do_loop(&mut self) -> Result<(), AuditError> {
        loop {
            let next = match self.report.state {
                SessionState::Idle => {
                    let url = self.report.url.clone();
                    self.driver.navigate(&url).await?;
                    SessionState::Navigated
                }
                SessionState::Navigated => {
                    self.report.api_ready_before = self.wait_for_api().await?;
                    SessionState::ApiReady
                }
                SessionState::ApiReady => {
                    let before = self.read_tc_data().await?;
                    if let Some(status) = before.event_status {
                        self.report.event_status_before = status;
                    }
                    self.report.metadata = self.read_metadata().await?;
                    self.inject().await?;
                    SessionState::ConsentInjected
                }
                SessionState::ConsentInjected => {
                    self.driver.reload().await?;
                    self.report.api_ready_after = self.wait_for_api().await?;
                    let after = self.read_tc_data().await?;
                    self.report.reported = after.tc_string;
                    if let Some(status) = after.event_status {
                        self.report.event_status_after = status;
                    }
                    let ping: PingReturn = self
                        .eval_or("ping", &scripts::ping(), true, PingReturn::default())
                        .await?;
                    if let Some(display_status) = ping.display_status {
                        self.report.display_status_after = display_status;
                    }
                    SessionState::Reloaded
                }
                SessionState::Reloaded => {
                    if let Err(e) = self.driver.navigate(&self.config.blank_url).await {
                        debug!(error = %e, "leaving page failed");
                    }
                    SessionState::Done
                }
                SessionState::Done | SessionState::Failed => return Ok(()),
            };
            self.transition(next);
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(url = %self.report.url, from = ?self.report.state, to = ?next, "session transition");
        self.report.state = next;
        self.report.transitions.push(next);
    }

    /// Poll until the consent API is defined and answers a ping with a
    /// non-zero CMP id. A timeout is not an error.
    async fn wait_for_api(&self) -> Result<bool, AuditError> {
        let driver = self.driver;
        let fatal: Mutex<Option<AuditError>> = Mutex::new(None);
        let fatal_slot = &fatal;

        let outcome = poll_until(self.config.readiness, move || async move {
            match api_answers(driver).await {
                Ok(ready) => ready,
                Err(e) if e.class() == ErrorClass::Transient => {
                    debug!(error = %e, "readiness check failed");
                    false
                }
                Err(e) => {
                    if let Ok(mut slot) = fatal_slot.lock() {
                        *slot = Some(e);
                    }
                    true
                }
            }
        })
        .await;

        if let Some(e) = fatal.into_inner().ok().flatten() {
            return Err(e);
        }
        if !outcome.is_ready() {
            debug!(
                url = %self.report.url,
                attempts = outcome.attempts(),
                "consent API not ready, continuing with defaults"
            );
        }
        Ok(outcome.is_ready())
    }

    async fn read_metadata(&self) -> Result<CmpMetadata, AuditError> {
        let fallback = &self.config.fallback;
        let ping: PingReturn = self
            .eval_or("ping", &scripts::ping(), true, PingReturn::default())
            .await?;

        let metadata = CmpMetadata {
            cmp_id: ping.cmp_id.unwrap_or(fallback.cmp_id),
            cmp_version: ping.cmp_version.unwrap_or(fallback.cmp_version),
            vendor_list_version: ping.gvl_version.unwrap_or(fallback.vendor_list_version),
            display_status: ping
                .display_status
                .unwrap_or_else(|| fallback.display_status.clone()),
        };
        debug!(url = %self.report.url, ?metadata, "CMP metadata");
        Ok(metadata)
    }

    async fn read_tc_data(&self) -> Result<TcDataReturn, AuditError> {
        self.eval_or("getTCData", &scripts::tc_data(), true, TcDataReturn::default())
            .await
    }

    async fn inject(&mut self) -> Result<(), AuditError> {
        let (record, encoded) = self
            .builder
            .build_encoded(self.report.metadata.identity(), OffsetDateTime::now_utc())?;

        let script = scripts::inject_consent(&encoded);
        match self.driver.evaluate(&script, false).await {
            Ok(_) => {}
            Err(e) if e.class() == ErrorClass::Transient => {
                warn!(url = %self.report.url, error = %e, "consent injection script failed");
            }
            Err(e) => return Err(e),
        }

        self.report.record = Some(record);
        self.report.injected = Some(encoded);
        Ok(())
    }

    /// Evaluate `expression` and decode it as `T`, or return `default` when
    /// the page yields nothing usable. Only transport-level failures are
    /// returned as errors.
    async fn eval_or<T: DeserializeOwned>(
        &self,
        label: &str,
        expression: &str,
        await_promise: bool,
        default: T,
    ) -> Result<T, AuditError> {
        let value = match self.driver.evaluate(expression, await_promise).await {
            Ok(value) => value,
            Err(e) if e.class() == ErrorClass::Transient => {
                warn!(url = %self.report.url, script = label, error = %e, "script evaluation failed");
                return Ok(default);
            }
            Err(e) => return Err(e),
        };
        if value.is_null() {
            debug!(script = label, "no value, using default");
            return Ok(default);
        }
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(decoded),
            Err(e) => {
                debug!(script = label, error = %e, "undecodable value, using default");
                Ok(default)
            }
        }
    }
}

async fn api_answers<D: BrowserDriver>(driver: &D) -> Result<bool, AuditError> {
    if !driver.evaluate(scripts::API_DEFINED, false).await?.as_bool().unwrap_or(false) {
        return Ok(false);
    }
    let ping = driver.evaluate(&scripts::ping(), true).await?;
    Ok(ping
        .get("cmpId")
        .and_then(serde_json::Value::as_u64)
        .is_some_and(|id| id != 0))
}
