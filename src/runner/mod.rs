//! Per-domain pipeline.
//!
//! For each domain the runner starts a fresh proxy with an empty
//! [`CookieStore`], opens a fresh page, runs one [`BrowserSession`] and
//! collects what both sides saw into a [`DomainOutcome`]. Nothing is shared
//! between two domains.

pub mod result;

pub use result::{ComplianceCondition, ComplianceResult, DomainOutcome};

use crate::base::error::AuditError;
use crate::browser::{BrowserDriver, PageFactory};
use crate::config::{ProxyConfig, SessionConfig};
use crate::consent::{ConsentCodec, ConsentRecordBuilder, TcfV2Codec};
use crate::cookies::CookieStore;
use crate::proxy::{CertificateAuthority, InterceptingProxy, ShutdownOutcome};
use crate::session::BrowserSession;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Runs the pipeline for one domain.
pub trait DomainRunner: Send + Sync {
    /// `Err` means nothing could be observed at all; a session that failed
    /// part-way still yields an outcome.
    fn run_domain(&self, domain: &str) -> impl Future<Output = Result<DomainOutcome, AuditError>> + Send;
}

pub struct ComplianceRunner<F, C = TcfV2Codec> {
    pages: F,
    builder: ConsentRecordBuilder<C>,
    proxy: ProxyConfig,
    session: SessionConfig,
    ca: Option<Arc<CertificateAuthority>>,
}

impl<F: PageFactory, C: ConsentCodec> ComplianceRunner<F, C> {
    pub fn new(
        pages: F,
        builder: ConsentRecordBuilder<C>,
        proxy: ProxyConfig,
        session: SessionConfig,
        ca: Option<Arc<CertificateAuthority>>,
    ) -> Self {
        Self {
            pages,
            builder,
            proxy,
            session,
            ca,
        }
    }

    pub fn pages(&self) -> &F {
        &self.pages
    }

    /// Give back the page factory, e.g. to shut the browser down.
    pub fn into_pages(self) -> F {
        self.pages
    }

    async fn start_proxy(&self, domain: &str, store: &CookieStore) -> Option<InterceptingProxy> {
        match InterceptingProxy::start(&self.proxy, domain, store.clone(), self.ca.clone()).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                error!(
                    domain = %domain,
                    error = %e,
                    mode = "degraded",
                    "proxy unavailable, third-party cookies will not be captured"
                );
                None
            }
        }
    }
}

impl<F: PageFactory, C: ConsentCodec> DomainRunner for ComplianceRunner<F, C> {
    async fn run_domain(&self, domain: &str) -> Result<DomainOutcome, AuditError> {
        let store = CookieStore::new();
        let proxy = self.start_proxy(domain, &store).await;
        let capture_active = proxy.is_some();

        let page = match self.pages.open_page().await {
            Ok(page) => page,
            Err(e) => {
                if let Some(proxy) = proxy {
                    proxy.shutdown().await;
                }
                return Err(e);
            }
        };

        let url = target_url(domain);
        let session = BrowserSession::new(&page, &self.builder, &self.session, &url)
            .run()
            .await;

        if let Err(e) = page.close().await {
            debug!(domain = %domain, error = %e, "page close failed");
        }
        if let Some(proxy) = proxy {
            if let ShutdownOutcome::Abandoned { open_connections } = proxy.shutdown().await {
                debug!(domain = %domain, open_connections, "proxy left connections open");
            }
        }

        let outcome = DomainOutcome {
            domain: domain.to_string(),
            session,
            cookies: store.snapshot(),
            capture_active,
        };
        info!(
            domain = %domain,
            state = ?outcome.session.state,
            cookies = outcome.cookies.len(),
            strings_agree = outcome.strings_agree(),
            condition = ?outcome.condition(),
            "domain visited"
        );
        Ok(outcome)
    }
}

/// `https://<domain>` unless the entry already names a scheme.
pub fn target_url(domain: &str) -> String {
    if domain.contains("://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    }
}
