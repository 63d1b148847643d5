use std::path::PathBuf;
use thiserror::Error;

/// How far an error is allowed to propagate.
///
/// The harness finishes a domain whenever it can and records what it saw, so
/// most failures are absorbed close to where they happen. Only `BatchFatal`
/// errors stop a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    /// A page-level script failed; the caller substitutes a default value.
    Transient,
    /// The current domain cannot continue; the batch moves on.
    SessionFatal,
    /// Supporting infrastructure failed; continue in a degraded mode.
    Infrastructure,
    /// Nothing more can be recorded durably; stop the batch.
    BatchFatal,
}

#[derive(Debug, Error)]
pub enum AuditError {
    // Page errors
    #[error("script evaluation failed: {reason}")]
    ScriptFailed { reason: String },

    // Session errors
    #[error("browser launch failed: {context}")]
    BrowserLaunch { context: String },
    #[error("navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },
    #[error("DevTools protocol error: {0}")]
    Cdp(String),
    #[error("DevTools command {method} timed out after {timeout_ms}ms")]
    CdpTimeout { method: String, timeout_ms: u64 },
    #[error("DevTools connection closed")]
    CdpClosed,
    #[error("domain session exceeded its {timeout_ms}ms deadline")]
    SessionDeadline { timeout_ms: u64 },

    // Infrastructure errors
    #[error("proxy could not bind {addr}: {source}")]
    ProxyBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate authority error: {0}")]
    Certificate(String),
    #[error("upstream connection to {host}:{port} failed: {reason}")]
    Upstream {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("checkpoint {path} unusable: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
    #[error("consent encoding failed: {0}")]
    Encoding(String),
    #[error("consent string could not be decoded: {0}")]
    Decoding(String),

    // Batch errors
    #[error("report {path} could not be written: {reason}")]
    Report { path: PathBuf, reason: String },
    #[error("domain list {path} could not be read: {reason}")]
    DomainList { path: PathBuf, reason: String },
    #[error("I/O error on {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    /// Classify this error for the propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            AuditError::ScriptFailed { .. } => ErrorClass::Transient,

            AuditError::BrowserLaunch { .. }
            | AuditError::NavigationFailed { .. }
            | AuditError::Cdp(_)
            | AuditError::CdpTimeout { .. }
            | AuditError::CdpClosed
            | AuditError::SessionDeadline { .. } => ErrorClass::SessionFatal,

            AuditError::ProxyBind { .. }
            | AuditError::Certificate(_)
            | AuditError::Upstream { .. }
            | AuditError::Tls(_)
            | AuditError::Checkpoint { .. }
            | AuditError::Encoding(_)
            | AuditError::Decoding(_) => ErrorClass::Infrastructure,

            AuditError::Report { .. } | AuditError::DomainList { .. } | AuditError::File { .. } => {
                ErrorClass::BatchFatal
            }
        }
    }

    pub fn is_batch_fatal(&self) -> bool {
        self.class() == ErrorClass::BatchFatal
    }

    pub fn script(reason: impl Into<String>) -> Self {
        AuditError::ScriptFailed {
            reason: reason.into(),
        }
    }

    pub fn launch(context: impl Into<String>) -> Self {
        AuditError::BrowserLaunch {
            context: context.into(),
        }
    }

    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        AuditError::NavigationFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn upstream(host: impl Into<String>, port: u16, reason: impl ToString) -> Self {
        AuditError::Upstream {
            host: host.into(),
            port,
            reason: reason.to_string(),
        }
    }

    pub fn report(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AuditError::Report {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<boring::error::ErrorStack> for AuditError {
    fn from(err: boring::error::ErrorStack) -> Self {
        AuditError::Tls(err.to_string())
    }
}
