//! # tcfaudit
//!
//! Audits how websites' consent management platforms (CMPs) react to an
//! injected TCF v2 consent string, and which third-party cookies they set
//! under that consent.
//!
//! For every domain in a list, `tcfaudit` points a remote-controlled Chrome
//! at an intercepting proxy, waits for the page's `__tcfapi` to come up,
//! reads the CMP identity, injects a synthetic consent record, reloads, and
//! compares what the CMP reports with what was injected. Meanwhile the proxy
//! records every cookie set by a third-party host.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tcfaudit::batch::{BatchOrchestrator, CsvReport, FileCheckpoint, read_domains};
//! use tcfaudit::browser::ChromeBrowser;
//! use tcfaudit::config::AuditConfig;
//! use tcfaudit::consent::ConsentRecordBuilder;
//! use tcfaudit::runner::ComplianceRunner;
//!
//! let config = AuditConfig::default();
//! let browser = ChromeBrowser::launch(&config.browser, config.proxy.listen_addr).await?;
//! let runner = ComplianceRunner::new(
//!     browser,
//!     ConsentRecordBuilder::new(config.policy),
//!     config.proxy.clone(),
//!     config.session.clone(),
//!     None,
//! );
//! let mut batch = BatchOrchestrator::new(
//!     runner,
//!     FileCheckpoint::new(&config.paths.checkpoint),
//!     CsvReport::open(&config.paths.output)?,
//! );
//! let summary = batch.run(&read_domains(&config.paths.domains)?).await?;
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy
//! - [`cookies`] - Captured cookies and the per-domain store
//! - [`proxy`] - MITM proxy, certificate authority, request/response interception
//! - [`consent`] - Consent records, policies and the TCF v2 codec
//! - [`browser`] - Browser driver traits and the Chrome DevTools implementation
//! - [`session`] - The per-page consent-injection state machine
//! - [`runner`] - Per-domain pipeline and result rows
//! - [`batch`] - Checkpointed batch orchestration and CSV I/O
//! - [`config`] - Run configuration
//! - [`telemetry`] - Logging setup

pub mod base;
pub mod batch;
pub mod browser;
pub mod config;
pub mod consent;
pub mod cookies;
pub mod proxy;
pub mod runner;
pub mod session;
pub mod telemetry;

pub use base::error::{AuditError, ErrorClass};
