//! Intercepting HTTP(S) proxy.
//!
//! The browser is pointed at this proxy for exactly one domain visit.
//! Plain requests arrive in absolute form and are forwarded as-is; `CONNECT`
//! tunnels are terminated with a leaf certificate from the
//! [`CertificateAuthority`] so the inner HTTP/1.1 exchange is visible.
//!
//! Around every forwarded exchange the proxy runs the two pure steps from
//! [`intercept`]: captured cookies are merged into requests toward the
//! domain under test, and third-party `Set-Cookie` headers are upserted into
//! the [`CookieStore`].
//!
//! ```text
//! browser ──► accept loop ──► http1 conn ──┬─► forward (absolute form)
//!                                          └─► CONNECT ─► TLS accept ─► http1 conn ─► forward
//! forward: decorate_request ─► upstream ─► observe_response ─► CookieStore::upsert
//! ```

pub mod ca;
pub mod intercept;
pub mod upstream;
pub mod waitgroup;

pub use ca::CertificateAuthority;
pub use intercept::{decorate_request, host_matches, observe_response};
pub use upstream::{ProxyBody, UpstreamConnector, UpstreamKey, UpstreamPool, UpstreamTlsConfig};
pub use waitgroup::{WaitGroup, WaitGuard};

use crate::base::context::IoResultExt;
use crate::base::error::AuditError;
use crate::config::ProxyConfig;
use crate::cookies::{CookieStore, Upsert};
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::{SockRef, TcpKeepalive};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const HOP_BY_HOP: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// How [`InterceptingProxy::shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every connection closed within the timeout.
    Graceful,
    /// Connections were still open at the timeout and were left behind.
    Abandoned { open_connections: usize },
}

struct ProxyShared {
    target_domain: String,
    store: CookieStore,
    ca: Option<Arc<CertificateAuthority>>,
    upstream: UpstreamConnector,
    server: http1::Builder,
    /// In-flight response handlers.
    handlers: WaitGroup,
    /// Open client connections and tunnels.
    connections: WaitGroup,
    shutdown: watch::Receiver<bool>,
}

/// A running proxy bound to one domain visit.
pub struct InterceptingProxy {
    local_addr: SocketAddr,
    shared: Arc<ProxyShared>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    config: ProxyConfig,
}

impl InterceptingProxy {
    /// Bind the listener and start accepting in the background.
    ///
    /// Without a CA, `CONNECT` tunnels are relayed blind and nothing inside
    /// them is captured.
    pub async fn start(
        config: &ProxyConfig,
        target_domain: &str,
        store: CookieStore,
        ca: Option<Arc<CertificateAuthority>>,
    ) -> Result<Self, AuditError> {
        let listener = bind(config.listen_addr)?;
        let local_addr = listener
            .local_addr()
            .bind_context(&config.listen_addr.to_string())?;

        let mut server = http1::Builder::new();
        server
            .timer(TokioTimer::new())
            .header_read_timeout(config.header_read_timeout);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ProxyShared {
            target_domain: target_domain.to_ascii_lowercase(),
            store,
            ca,
            upstream: UpstreamConnector::new(
                UpstreamTlsConfig::with_verify(config.verify_upstream),
                config.upstream_connect_timeout,
            ),
            server,
            handlers: WaitGroup::new(),
            connections: WaitGroup::new(),
            shutdown: shutdown_rx,
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), config.keepalive));
        info!(addr = %local_addr, domain = %target_domain, "proxy listening");

        Ok(Self {
            local_addr,
            shared,
            shutdown_tx,
            accept_task,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &CookieStore {
        &self.shared.store
    }

    pub fn open_connections(&self) -> usize {
        self.shared.connections.count()
    }

    /// Drain in-flight handlers, then close every connection within the
    /// shutdown timeout. Never panics; a timeout leaves stragglers behind.
    pub async fn shutdown(self) -> ShutdownOutcome {
        let drain = self.config.drain_timeout;
        if tokio::time::timeout(drain, self.shared.handlers.wait()).await.is_err() {
            warn!(
                pending = self.shared.handlers.count(),
                timeout_ms = drain.as_millis() as u64,
                "in-flight response handlers did not finish"
            );
        }

        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;

        let limit = self.config.shutdown_timeout;
        match tokio::time::timeout(limit, self.shared.connections.wait()).await {
            Ok(()) => {
                debug!(addr = %self.local_addr, "proxy stopped");
                ShutdownOutcome::Graceful
            }
            Err(_) => {
                let open_connections = self.shared.connections.count();
                warn!(
                    addr = %self.local_addr,
                    open_connections,
                    timeout_ms = limit.as_millis() as u64,
                    "proxy shutdown timed out, abandoning connections"
                );
                ShutdownOutcome::Abandoned { open_connections }
            }
        }
    }
}

impl std::fmt::Debug for InterceptingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptingProxy")
            .field("local_addr", &self.local_addr)
            .field("target_domain", &self.shared.target_domain)
            .field("mitm", &self.shared.ca.is_some())
            .finish()
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, AuditError> {
    let label = addr.to_string();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .bind_context(&label)?;
    socket.set_reuseaddr(true).bind_context(&label)?;
    socket.bind(addr).bind_context(&label)?;
    socket.listen(1024).bind_context(&label)
}

/// Resolves once shutdown has been signalled, including before the call.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn set_keepalive(stream: &TcpStream, time: std::time::Duration) -> std::io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(time))
}

async fn accept_loop(listener: TcpListener, shared: Arc<ProxyShared>, keepalive: std::time::Duration) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = set_keepalive(&stream, keepalive) {
                        debug!(peer = %peer, error = %e, "keepalive not set");
                    }
                    let guard = shared.connections.enter();
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        serve_client(shared, stream).await;
                        drop(guard);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
    trace!("accept loop exited");
}

/// Serve plain-proxy requests from one browser connection.
async fn serve_client(shared: Arc<ProxyShared>, stream: TcpStream) {
    let pool = Arc::new(UpstreamPool::new());
    let handler = shared.clone();
    let svc = service_fn(move |req: Request<Incoming>| {
        let shared = handler.clone();
        let pool = pool.clone();
        async move { Ok::<_, Infallible>(shared.handle(req, &pool).await) }
    });

    let conn = shared
        .server
        .serve_connection(TokioIo::new(stream), svc)
        .with_upgrades();
    tokio::pin!(conn);

    let mut shutdown = shared.shutdown.clone();
    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(error = %e, "client connection ended with error");
            }
        }
        _ = stop_requested(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

impl ProxyShared {
    async fn handle(self: Arc<Self>, req: Request<Incoming>, pool: &UpstreamPool) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.tunnel(req);
        }

        let Some(host) = req.uri().host().map(str::to_ascii_lowercase) else {
            debug!(uri = %req.uri(), "origin-form request sent to proxy");
            return status_response(StatusCode::BAD_REQUEST);
        };
        let tls = req.uri().scheme() == Some(&http::uri::Scheme::HTTPS);
        let port = req
            .uri()
            .port_u16()
            .unwrap_or(if tls { 443 } else { 80 });
        self.forward(req, UpstreamKey { host, port, tls }, pool).await
    }

    /// Answer `CONNECT` and take over the upgraded stream.
    fn tunnel(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let key = UpstreamKey {
            host: authority.host().to_ascii_lowercase(),
            port: authority.port_u16().unwrap_or(443),
            tls: true,
        };

        let guard = self.connections.enter();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!(host = %key.host, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };
            let result = match self.ca.clone() {
                Some(ca) => self.clone().serve_mitm(upgraded, key.clone(), ca).await,
                None => relay(upgraded, &key).await,
            };
            if let Err(e) = result {
                debug!(host = %key.host, error = %e, "tunnel closed with error");
            }
            drop(guard);
        });

        status_response(StatusCode::OK)
    }

    async fn serve_mitm(
        self: Arc<Self>,
        upgraded: Upgraded,
        key: UpstreamKey,
        ca: Arc<CertificateAuthority>,
    ) -> Result<(), AuditError> {
        let acceptor = ca.acceptor_for(&key.host)?;
        let tls = tokio_boring::accept(&acceptor, TokioIo::new(upgraded))
            .await
            .map_err(|e| AuditError::Tls(format!("accept for {}: {e:?}", key.host)))?;

        let pool = Arc::new(UpstreamPool::new());
        let handler = self.clone();
        let route = key.clone();
        let svc = service_fn(move |req: Request<Incoming>| {
            let shared = handler.clone();
            let pool = pool.clone();
            let key = route.clone();
            async move { Ok::<_, Infallible>(shared.forward(req, key, &pool).await) }
        });

        let conn = self.server.serve_connection(TokioIo::new(tls), svc);
        tokio::pin!(conn);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(host = %key.host, error = %e, "tunnel connection ended with error");
                }
            }
            _ = stop_requested(&mut shutdown) => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
        Ok(())
    }

    /// Forward one request, decorating it on the way out and observing the
    /// response on the way back.
    async fn forward(
        &self,
        req: Request<Incoming>,
        key: UpstreamKey,
        pool: &UpstreamPool,
    ) -> Response<ProxyBody> {
        let _in_flight = self.handlers.enter();

        let snapshot = self.store.snapshot();
        let req = decorate_request(&snapshot, &self.target_domain, &key.host, req);
        let req = into_origin_form(req, &key).map(|body| body.boxed());

        let response = match self.upstream.send(pool, key.clone(), req).await {
            Ok(response) => response,
            Err(e) => {
                debug!(host = %key.host, error = %e, "upstream request failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let now = OffsetDateTime::now_utc();
        for cookie in observe_response(&self.target_domain, &key.host, &response, now) {
            let name = cookie.name.clone();
            let domain = cookie.domain.clone();
            if self.store.upsert(cookie) == Upsert::Replaced {
                trace!(host = %key.host, %name, %domain, "cookie updated");
            } else {
                debug!(host = %key.host, %name, %domain, "third-party cookie captured");
            }
        }

        response.map(|body| body.boxed())
    }
}

/// Pass a tunnel through untouched.
async fn relay(upgraded: Upgraded, key: &UpstreamKey) -> Result<(), AuditError> {
    let mut server = TcpStream::connect((key.host.as_str(), key.port))
        .await
        .map_err(|e| AuditError::upstream(&key.host, key.port, e))?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut server)
        .await
        .map_err(|e| AuditError::upstream(&key.host, key.port, e))?;
    Ok(())
}

/// Rewrite a proxied request into what an origin server expects.
fn into_origin_form<B>(req: Request<B>, key: &UpstreamKey) -> Request<B> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));

    if !parts.headers.contains_key(HOST) {
        let default_port = if key.tls { 443 } else { 80 };
        let host = if key.port == default_port {
            key.host.clone()
        } else {
            format!("{}:{}", key.host, key.port)
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(HOST, value);
        }
    }
    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }

    Request::from_parts(parts, body)
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str, port: u16, tls: bool) -> UpstreamKey {
        UpstreamKey {
            host: host.into(),
            port,
            tls,
        }
    }

    #[test]
    fn test_origin_form_rewrite() {
        let req = Request::get("http://ads.example:8080/px?id=1")
            .header("proxy-connection", "keep-alive")
            .body(())
            .unwrap();
        let req = into_origin_form(req, &key("ads.example", 8080, false));
        assert_eq!(req.uri(), "/px?id=1");
        assert_eq!(req.headers()[HOST], "ads.example:8080");
        assert!(req.headers().get("proxy-connection").is_none());
    }

    #[test]
    fn test_origin_form_keeps_host_header() {
        let req = Request::get("/")
            .header(HOST, "www.site.example")
            .body(())
            .unwrap();
        let req = into_origin_form(req, &key("www.site.example", 443, true));
        assert_eq!(req.headers()[HOST], "www.site.example");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_infrastructure_error() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ProxyConfig {
            listen_addr: holder.local_addr().unwrap(),
            ..ProxyConfig::default()
        };
        let err = InterceptingProxy::start(&config, "site.example", CookieStore::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::ProxyBind { .. }));
    }

    #[tokio::test]
    async fn test_idle_proxy_shuts_down_gracefully() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ProxyConfig::default()
        };
        let proxy = InterceptingProxy::start(&config, "site.example", CookieStore::new(), None)
            .await
            .unwrap();
        assert_ne!(proxy.local_addr().port(), 0);
        assert_eq!(proxy.shutdown().await, ShutdownOutcome::Graceful);
    }
}
