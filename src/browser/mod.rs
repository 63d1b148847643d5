//! Remote-controlled browser.
//!
//! The session layer only sees [`BrowserDriver`] and [`PageFactory`]. The
//! production implementation drives Chrome over the DevTools protocol:
//!
//! - [`launcher::ChromeBrowser`] starts (or attaches to) Chrome and opens
//!   one tab per domain through the DevTools HTTP endpoint
//! - [`page::CdpPage`] implements the driver on top of one tab
//! - [`cdp::CdpConnection`] is the WebSocket JSON-RPC transport

pub mod cdp;
pub mod launcher;
pub mod page;

pub use cdp::CdpConnection;
pub use launcher::ChromeBrowser;
pub use page::CdpPage;

use crate::base::error::AuditError;
use serde_json::Value;
use std::future::Future;

/// One controllable page.
pub trait BrowserDriver: Send + Sync {
    /// Load `url` and wait for the load event.
    fn navigate(&self, url: &str) -> impl Future<Output = Result<(), AuditError>> + Send;

    /// Evaluate a script expression and return its JSON value.
    ///
    /// With `await_promise`, a promise result is awaited before returning.
    /// A thrown exception is an [`AuditError::ScriptFailed`].
    fn evaluate(
        &self,
        expression: &str,
        await_promise: bool,
    ) -> impl Future<Output = Result<Value, AuditError>> + Send;

    fn reload(&self) -> impl Future<Output = Result<(), AuditError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), AuditError>> + Send;
}

/// Hands out a fresh page per domain visit.
pub trait PageFactory: Send + Sync {
    type Driver: BrowserDriver;

    fn open_page(&self) -> impl Future<Output = Result<Self::Driver, AuditError>> + Send;
}
