//! Run configuration.
//!
//! Every struct carries working defaults; the CLI overrides individual
//! fields.

use crate::consent::ConsentPolicy;
use crate::session::metadata::CmpMetadata;
use crate::session::wait::PollConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Intercepting proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address (default: 127.0.0.1:8080)
    pub listen_addr: SocketAddr,
    /// Idle time before TCP keep-alive packets start (default: 30s)
    pub keepalive: Duration,
    /// Time allowed for a client to send request headers (default: 30s)
    pub header_read_timeout: Duration,
    /// Budget for in-flight response handlers at shutdown (default: 10s)
    pub drain_timeout: Duration,
    /// Budget for closing client connections at shutdown (default: 5s)
    pub shutdown_timeout: Duration,
    /// Connect budget toward origin servers (default: 10s)
    pub upstream_connect_timeout: Duration,
    /// Verify origin certificates (default: false)
    pub verify_upstream: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            keepalive: Duration::from_secs(30),
            header_read_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            upstream_connect_timeout: Duration::from_secs(10),
            verify_upstream: false,
        }
    }
}

/// Per-domain browser session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hard deadline for one domain's session (default: 60s)
    pub deadline: Duration,
    /// Consent API readiness polling (default: every 1s for 10s)
    pub readiness: PollConfig,
    /// Page loaded once the session is over
    pub blank_url: String,
    /// Metadata used for every field the CMP does not report
    pub fallback: CmpMetadata,
    /// Event status used when the CMP does not report one
    pub fallback_event_status: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            readiness: PollConfig::default(),
            blank_url: "about:blank".to_string(),
            fallback: CmpMetadata::default(),
            fallback_event_status: String::new(),
        }
    }
}

/// How to obtain a browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Chrome executable (default: `google-chrome`)
    pub executable: PathBuf,
    /// Attach to this DevTools HTTP endpoint instead of launching
    pub attach_to: Option<String>,
    pub headless: bool,
    /// Profile directory; a temporary one is used when unset
    pub user_data_dir: Option<PathBuf>,
    /// Time for Chrome to expose its DevTools endpoint (default: 15s)
    pub startup_timeout: Duration,
    /// Time to wait for a page's load event (default: 30s)
    pub page_load_timeout: Duration,
    /// Time to wait for any single DevTools reply (default: 30s)
    pub command_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("google-chrome"),
            attach_to: None,
            headless: false,
            user_data_dir: None,
            startup_timeout: Duration::from_secs(15),
            page_load_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Input, output and checkpoint files.
#[derive(Debug, Clone)]
pub struct BatchPaths {
    pub domains: PathBuf,
    pub output: PathBuf,
    pub checkpoint: PathBuf,
}

impl Default for BatchPaths {
    fn default() -> Self {
        Self {
            domains: PathBuf::from("domains.csv"),
            output: PathBuf::from("output.csv"),
            checkpoint: PathBuf::from("progress.txt"),
        }
    }
}

/// Everything one batch run needs.
#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    pub browser: BrowserConfig,
    pub policy: ConsentPolicy,
    pub paths: BatchPaths,
}
