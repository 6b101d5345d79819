//! Pooled reqwest transport.
//!
//! One process-wide pool, built once from [`PoolConfig`]. Reconfiguring swaps
//! in a freshly built client; requests that already loaded the old one keep
//! using it until they finish.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use reqwest::Client;
use ripfetch_core::AppConfig;

use super::{Transport, TransportError, TransportRequest, TransportResponse};

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Idle connections kept per destination (default: 100)
    pub max_connections: usize,

    /// Requested pipelining depth (default: 1)
    pub pipelining: usize,

    /// How long an idle connection stays pooled (default: 4s)
    pub keep_alive_timeout: Duration,

    /// TCP/TLS connect deadline (default: 10s)
    pub connect_timeout: Duration,

    /// Wait for the response head (default: 300s)
    pub headers_timeout: Duration,

    /// Wait between two body reads (default: 300s)
    pub body_timeout: Duration,

    /// Default User-Agent when the request does not set one
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_connections: config.pool_connections,
            pipelining: config.pool_pipelining,
            keep_alive_timeout: Duration::from_millis(config.pool_keep_alive_timeout_ms),
            connect_timeout: Duration::from_millis(config.pool_connect_timeout_ms),
            headers_timeout: Duration::from_millis(config.pool_headers_timeout_ms),
            body_timeout: Duration::from_millis(config.pool_body_timeout_ms),
            user_agent: config.user_agent.clone(),
        }
    }
}

#[derive(Debug)]
struct ActivePool {
    http: Client,
    config: PoolConfig,
}

impl ActivePool {
    fn build(config: PoolConfig) -> Result<Self, TransportError> {
        if config.pipelining > 1 {
            tracing::debug!(
                pipelining = config.pipelining,
                "HTTP/1 pipelining unavailable; relying on HTTP/2 multiplexing"
            );
        }

        let http = Client::builder()
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .tcp_keepalive(config.keep_alive_timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;

        Ok(Self { http, config })
    }
}

/// Process-wide pooled HTTP transport.
#[derive(Debug)]
pub struct TransportPool {
    active: ArcSwap<ActivePool>,
}

impl TransportPool {
    /// Build the pool. Fails only if the TLS backend cannot be initialized.
    pub fn new(config: PoolConfig) -> Result<Self, TransportError> {
        let active = ActivePool::build(config)?;
        Ok(Self { active: ArcSwap::from_pointee(active) })
    }

    /// Replace the active pool. In-flight requests are not disturbed.
    pub fn reconfigure(&self, config: PoolConfig) -> Result<(), TransportError> {
        let next = ActivePool::build(config)?;
        tracing::info!(
            max_connections = next.config.max_connections,
            keep_alive_ms = next.config.keep_alive_timeout.as_millis() as u64,
            "transport pool reconfigured"
        );
        self.active.store(Arc::new(next));
        Ok(())
    }

    /// Configuration of the currently active pool.
    pub fn config(&self) -> PoolConfig {
        self.active.load().config.clone()
    }
}

#[async_trait::async_trait]
impl Transport for TransportPool {
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let pool = self.active.load_full();
        let headers_timeout = pool.config.headers_timeout;
        let body_timeout = pool.config.body_timeout;

        let send = pool.http.get(request.url.clone()).headers(request.headers).send();
        let response = tokio::time::timeout(headers_timeout, send)
            .await
            .map_err(|_| TransportError::Timeout(format!("no response head within {}ms", headers_timeout.as_millis())))??;

        let status = response.status();
        let final_url = response.url().clone();
        let headers = response.headers().clone();

        tracing::debug!("response head {} -> {} ({})", request.url, final_url, status.as_u16());

        let mut chunks = Box::pin(response.bytes_stream());
        let body = async_stream::stream! {
            // the body keeps its pool alive across a reconfigure
            let _bound = pool;
            loop {
                match tokio::time::timeout(body_timeout, chunks.next()).await {
                    Err(_) => {
                        yield Err(TransportError::Timeout(format!("body read stalled for {}ms", body_timeout.as_millis())));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(bytes))) => yield Ok(bytes),
                    Ok(Some(Err(e))) => {
                        yield Err(TransportError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(TransportResponse { status, final_url, headers, body: Box::pin(body) })
    }
}
