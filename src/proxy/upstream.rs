use crate::base::error::AuditError;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// TLS settings for the proxy's outbound leg.
///
/// Only HTTP/1.1 is offered over ALPN since the forwarding path speaks
/// HTTP/1.1 on both sides.
#[derive(Debug, Clone)]
pub struct UpstreamTlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub alpn_protos: Vec<String>,
    /// Verify the origin's certificate chain and hostname.
    pub verify: bool,
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            alpn_protos: vec!["http/1.1".to_string()],
            verify: false,
        }
    }
}

impl UpstreamTlsConfig {
    pub fn with_verify(verify: bool) -> Self {
        Self {
            verify,
            ..Self::default()
        }
    }

    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), AuditError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min))?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max))?;
        }

        if !self.alpn_protos.is_empty() {
            let mut alpn_wire = Vec::new();
            for proto in &self.alpn_protos {
                if proto.len() > 255 {
                    return Err(AuditError::Tls(format!("ALPN protocol too long: {proto}")));
                }
                alpn_wire.push(proto.len() as u8);
                alpn_wire.extend_from_slice(proto.as_bytes());
            }
            builder.set_alpn_protos(&alpn_wire)?;
        }

        builder.set_verify(if self.verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        Ok(())
    }

    /// SNI must not carry a raw IP address (RFC 6066).
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

/// Where a forwarded request goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Idle upstream senders for one client connection.
#[derive(Default)]
pub struct UpstreamPool {
    idle: DashMap<UpstreamKey, http1::SendRequest<ProxyBody>>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

/// Opens HTTP/1.1 connections to origin servers.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    tls: UpstreamTlsConfig,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(tls: UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    /// Send `request` to `key`, reusing an idle connection from `pool` when
    /// one is still usable.
    pub async fn send(
        &self,
        pool: &UpstreamPool,
        key: UpstreamKey,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, AuditError> {
        let reusable = match pool.idle.remove(&key) {
            Some((_, mut sender)) if !sender.is_closed() => {
                sender.ready().await.ok().map(|_| sender)
            }
            _ => None,
        };
        let mut sender = match reusable {
            Some(sender) => sender,
            None => self.connect(&key).await?,
        };

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| AuditError::upstream(&key.host, key.port, e))?;
        pool.idle.insert(key, sender);
        Ok(response)
    }

    async fn connect(&self, key: &UpstreamKey) -> Result<http1::SendRequest<ProxyBody>, AuditError> {
        let stream = tokio::time::timeout(self.connect_timeout, self.dial(key))
            .await
            .map_err(|_| {
                AuditError::upstream(
                    &key.host,
                    key.port,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })??;

        if !key.tls {
            return handshake(stream, key).await;
        }

        let mut builder = SslConnector::builder(SslMethod::tls())?;
        self.tls.apply_to_builder(&mut builder)?;
        let connector = builder.build();
        let mut config = connector.configure()?;
        config.set_use_server_name_indication(UpstreamTlsConfig::should_set_sni(&key.host));
        config.set_verify_hostname(self.tls.verify);

        let tls_stream = tokio_boring::connect(config, &key.host, stream)
            .await
            .map_err(|e| AuditError::upstream(&key.host, key.port, format!("{e:?}")))?;
        handshake(tls_stream, key).await
    }

    async fn dial(&self, key: &UpstreamKey) -> Result<TcpStream, AuditError> {
        let addrs = tokio::net::lookup_host((key.host.as_str(), key.port))
            .await
            .map_err(|e| AuditError::upstream(&key.host, key.port, e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(AuditError::upstream(
            &key.host,
            key.port,
            last_err.map_or_else(|| "no addresses".to_string(), |e| e.to_string()),
        ))
    }
}

async fn handshake<S>(
    stream: S,
    key: &UpstreamKey,
) -> Result<http1::SendRequest<ProxyBody>, AuditError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| AuditError::upstream(&key.host, key.port, e))?;

    let host = key.host.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(host = %host, error = %e, "upstream connection ended with error");
        }
    });
    Ok(sender)
}
